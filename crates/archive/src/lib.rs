// SPDX-License-Identifier: MPL-2.0

//! Package artifact container format (spec.md §6, "Package artifact
//! file"): a zstd-compressed tar archive whose trailing bytes are a
//! metadata dump followed by a fixed-size footer encoding the dump's
//! offset and length. Extraction reads the footer, seeks to the dump,
//! pulls the metadata out, then decompresses and unpacks the tar portion.
//!
//! Built the way the teacher builds its own binary container formats:
//! a typed footer with explicit `encode`/`decode`, a `thiserror` error
//! enum, and round-trip tests over an in-memory `Cursor`.

use std::io::{self, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAGIC: [u8; 4] = *b"ENTA";
const FOOTER_LEN: usize = 24;
const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed artifact footer")]
    BadFooter,
    #[error("unsupported artifact format version: {0}")]
    UnsupportedVersion(u16),
    #[error("metadata serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("architecture mismatch: artifact is {artifact}, host is {host}")]
    ArchMismatch { artifact: String, host: String },
}

/// The metadata dump embedded at the tail of a package artifact. Kept
/// independent of `store::Record` so this crate has no dependency on the
/// store; the action engine maps between the two.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub arch: String,
    pub category: String,
    pub name: String,
    pub version: String,
    pub slot: Option<String>,
    pub sha256: String,
}

struct Footer {
    dump_offset: u64,
    dump_length: u64,
    format_version: u16,
}

impl Footer {
    fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut buf = [0u8; FOOTER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..12].copy_from_slice(&self.dump_offset.to_le_bytes());
        buf[12..20].copy_from_slice(&self.dump_length.to_le_bytes());
        buf[20..22].copy_from_slice(&self.format_version.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < FOOTER_LEN || buf[0..4] != MAGIC {
            return Err(Error::BadFooter);
        }
        let dump_offset = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let dump_length = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let format_version = u16::from_le_bytes(buf[20..22].try_into().unwrap());
        if format_version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(format_version));
        }
        Ok(Footer { dump_offset, dump_length, format_version })
    }
}

/// Builds a complete artifact: tar entries appended via `write_tar`,
/// zstd-compressed, followed by the serialized `metadata` and its footer.
/// `write_tar` owns entry iteration so this crate stays agnostic of the
/// filesystem layout being packaged.
pub fn write_artifact<W: Write>(
    mut out: W,
    metadata: &Metadata,
    write_tar: impl FnOnce(&mut tar::Builder<Vec<u8>>) -> io::Result<()>,
) -> Result<(), Error> {
    let mut builder = tar::Builder::new(Vec::new());
    write_tar(&mut builder)?;
    let tar_bytes = builder.into_inner()?;

    let compressed = zstd::encode_all(&tar_bytes[..], 0)?;
    out.write_all(&compressed)?;
    let dump_offset = compressed.len() as u64;

    let dump = serde_json::to_vec(metadata)?;
    out.write_all(&dump)?;

    let footer = Footer {
        dump_offset,
        dump_length: dump.len() as u64,
        format_version: FORMAT_VERSION,
    };
    out.write_all(&footer.encode())?;
    Ok(())
}

/// Reads just the footer and metadata dump (spec.md §6: "read footer, seek
/// to dump offset, slice out metadata"), without touching the tar payload.
pub fn read_metadata<R: Read + Seek>(mut reader: R) -> Result<Metadata, Error> {
    let footer = read_footer(&mut reader)?;

    reader.seek(SeekFrom::Start(footer.dump_offset))?;
    let mut dump = vec![0u8; footer.dump_length as usize];
    reader.read_exact(&mut dump)?;

    Ok(serde_json::from_slice(&dump)?)
}

/// [`read_metadata`] plus the host-arch check (spec.md §6 "Architecture
/// mismatch ... is detected ... and refused").
pub fn read_metadata_checked<R: Read + Seek>(reader: R, host_arch: &str) -> Result<Metadata, Error> {
    let metadata = read_metadata(reader)?;
    if metadata.arch != host_arch {
        return Err(Error::ArchMismatch {
            artifact: metadata.arch,
            host: host_arch.to_string(),
        });
    }
    Ok(metadata)
}

/// Decompresses and hands back the tar portion of the container, ready
/// for `tar::Archive::entries()`/`unpack()`.
pub fn tar_archive<R: Read + Seek>(mut reader: R) -> Result<tar::Archive<io::Cursor<Vec<u8>>>, Error> {
    let footer = read_footer(&mut reader)?;

    reader.seek(SeekFrom::Start(0))?;
    let mut compressed = vec![0u8; footer.dump_offset as usize];
    reader.read_exact(&mut compressed)?;

    let tar_bytes = zstd::decode_all(&compressed[..])?;
    Ok(tar::Archive::new(io::Cursor::new(tar_bytes)))
}

fn read_footer<R: Read + Seek>(reader: &mut R) -> Result<Footer, Error> {
    reader.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
    let mut buf = [0u8; FOOTER_LEN];
    reader.read_exact(&mut buf)?;
    Footer::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_metadata() -> Metadata {
        Metadata {
            arch: "x86_64".to_string(),
            category: "core".to_string(),
            name: "bash".to_string(),
            version: "5.2".to_string(),
            slot: None,
            sha256: "deadbeef".to_string(),
        }
    }

    #[test]
    fn roundtrip() {
        let metadata = sample_metadata();
        let mut buf: Cursor<Vec<u8>> = Cursor::new(Vec::new());

        write_artifact(&mut buf, &metadata, |builder| {
            let data = b"hello world";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, "hello.txt", &data[..])?;
            Ok(())
        })
        .unwrap();

        buf.set_position(0);
        let read_back = read_metadata(&mut buf).unwrap();
        assert_eq!(read_back, metadata);

        buf.set_position(0);
        let mut archive = tar_archive(&mut buf).unwrap();
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "hello.txt");
        let mut contents = String::new();
        entry.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello world");
    }

    #[test]
    fn arch_mismatch_is_refused() {
        let metadata = sample_metadata();
        let mut buf: Cursor<Vec<u8>> = Cursor::new(Vec::new());
        write_artifact(&mut buf, &metadata, |_| Ok(())).unwrap();

        buf.set_position(0);
        let err = read_metadata_checked(&mut buf, "aarch64").unwrap_err();
        assert!(matches!(err, Error::ArchMismatch { .. }));
    }

    #[test]
    fn bad_footer_is_rejected() {
        let mut buf: Cursor<Vec<u8>> = Cursor::new(vec![0u8; FOOTER_LEN]);
        let err = read_metadata(&mut buf).unwrap_err();
        assert!(matches!(err, Error::BadFooter));
    }

    #[test]
    fn footer_encode_decode_is_symmetric() {
        let footer = Footer {
            dump_offset: 1234,
            dump_length: 56,
            format_version: FORMAT_VERSION,
        };
        let decoded = Footer::decode(&footer.encode()).unwrap();
        assert_eq!(decoded.dump_offset, footer.dump_offset);
        assert_eq!(decoded.dump_length, footer.dump_length);
        assert_eq!(decoded.format_version, footer.format_version);
    }
}
