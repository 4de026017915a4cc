//! Backup artifacts: formats, file naming, the compression/encryption layers and
//! format sniffing on the way back in.

pub mod interchange;
pub mod records;
pub mod sql_script;

use crate::vault::compress::{build_decompressor, CompressorBuilder, CompressorConfig, XZ_MAGIC};
use crate::vault::encrypt::{EncryptorBuilder, EncryptorConfig, AGE_MAGIC};
use crate::vault::file_ext::FileExtProvider;
use crate::vault::finish::Finish;
use crate::vault::model::backup_record::BackupType;
use crate::vault::model::connection::Engine;
use crate::vault::model::text_enum;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithMsg;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Chain, Cursor, IntoInnerError, Read};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};

pub const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";
pub const PG_CUSTOM_MAGIC: &[u8] = b"PGDMP";
static TIME_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";
static HEAD_LEN: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// Engine-native dump: SQLite database file, Postgres custom-format archive
    Native,
    /// Plain SQL text
    Sql,
    /// Engine-agnostic JSON Lines records
    Interchange,
}

text_enum!(ArtifactFormat {
    Native => "native",
    Sql => "sql",
    Interchange => "interchange",
});

impl ArtifactFormat {
    /// What a backup produces when the caller does not choose.
    pub fn default_for(engine: Engine, backup_type: BackupType) -> ArtifactFormat {
        match (engine, backup_type) {
            (Engine::Postgres, _) => ArtifactFormat::Native,
            (Engine::MySql, _) => ArtifactFormat::Sql,
            (Engine::Sqlite, BackupType::Full) => ArtifactFormat::Native,
            (Engine::Sqlite, BackupType::Schema) => ArtifactFormat::Sql,
            (Engine::Sqlite, BackupType::Data) => ArtifactFormat::Interchange,
        }
    }

    /// MySQL has no binary dump format, its native tool writes SQL text.
    pub fn supported_by(self, engine: Engine) -> ArtifactFormat {
        match (engine, self) {
            (Engine::MySql, ArtifactFormat::Native) => ArtifactFormat::Sql,
            (_, f) => f,
        }
    }

    pub fn extension(&self, engine: Engine) -> &'static str {
        match (self, engine) {
            (ArtifactFormat::Native, Engine::Sqlite) => "sqlite3",
            (ArtifactFormat::Native, _) => "dump",
            (ArtifactFormat::Sql, _) => "sql",
            (ArtifactFormat::Interchange, _) => "jsonl",
        }
    }
}

/// `<engine>-<type>-<timestamp>.<ext>[.xz][.age]`
pub fn artifact_file_name(
    engine: Engine,
    backup_type: BackupType,
    format: ArtifactFormat,
    dt: DateTime<Utc>,
    compressor: &CompressorConfig,
    encryptor: &EncryptorConfig,
) -> String {
    let ext = std::iter::once(format.extension(engine).into())
        .chain(compressor.file_ext())
        .chain(encryptor.file_ext())
        .join(".");
    format!("{}-{}-{}.{}", engine, backup_type, dt.format(TIME_FORMAT), ext)
}

/// Engine that wrote a native dump, from its magic bytes.
pub fn native_engine(head: &[u8]) -> Option<Engine> {
    if head.starts_with(SQLITE_MAGIC) {
        Some(Engine::Sqlite)
    } else if head.starts_with(PG_CUSTOM_MAGIC) {
        Some(Engine::Postgres)
    } else {
        None
    }
}

/// Content first, file extension as a tie-breaker, SQL text otherwise.
pub fn sniff_format(head: &[u8], path: &Path) -> ArtifactFormat {
    if native_engine(head).is_some() {
        return ArtifactFormat::Native;
    }
    if interchange::is_interchange_head(head) {
        return ArtifactFormat::Interchange;
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let inner = name
        .trim_end_matches(".age")
        .trim_end_matches(".xz")
        .rsplit('.')
        .next()
        .unwrap_or_default();
    match inner {
        "sqlite" | "sqlite3" | "db" | "dump" | "backup" => ArtifactFormat::Native,
        "jsonl" | "json" | "ndjson" => ArtifactFormat::Interchange,
        _ => ArtifactFormat::Sql,
    }
}

/// Reads up to `HEAD_LEN` bytes and hands back a reader that still yields them.
fn peek<R: Read>(mut reader: R) -> Result<(Vec<u8>, Chain<Cursor<Vec<u8>>, R>)> {
    let mut head = Vec::with_capacity(HEAD_LEN);
    let mut buf = [0u8; 512];
    while head.len() < HEAD_LEN {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Ok((head.clone(), Cursor::new(head).chain(reader)))
}

/// Runs a finished raw artifact through compression and encryption and moves it
/// to `out_path`. The result is written to `<out_path>.tmp` first and renamed on
/// success, so an existing artifact is never partially overwritten.
pub fn encode_artifact(
    raw: &Path,
    out_path: &Path,
    compressor: &CompressorConfig,
    encryptor: &EncryptorConfig,
) -> Result<()> {
    if out_path.exists() {
        return Err(Error::invalid_state(format!(
            "artifact {out_path:?} already exists"
        )));
    }
    let mut tmp_name = out_path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let write = || -> Result<()> {
        let mut writer = File::create_new(&tmp_path)
            .map(BufWriter::new)
            .map_err(Error::from)
            .and_then(|f| encryptor.build_encryptor(f))
            .map(BufWriter::new)
            .and_then(|f| compressor.build_compressor(f))
            .map(BufWriter::new)?;

        std::io::copy(&mut BufReader::new(File::open(raw)?), &mut writer)?;

        writer
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .finish()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .finish()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .sync_all()?;
        std::fs::rename(&tmp_path, out_path)?;
        Ok(())
    };

    write().map_err(|mut e| {
        if tmp_path.exists() {
            if let Err(e2) = std::fs::remove_file(&tmp_path) {
                e = e.chain(e2.into()).with_msg("Delete tmp artifact failed.");
            }
        }
        e
    })
}

/// Artifact ready to be read by a restore strategy.
#[derive(Debug)]
pub struct DecodedArtifact {
    file: ArtifactFile,
    pub format: ArtifactFormat,
    /// Engine that produced a native dump
    pub native_engine: Option<Engine>,
    pub was_compressed: bool,
    pub was_encrypted: bool,
}

#[derive(Debug)]
enum ArtifactFile {
    Original(PathBuf),
    Decoded(TempPath),
}

impl DecodedArtifact {
    pub fn path(&self) -> &Path {
        match &self.file {
            ArtifactFile::Original(p) => p.as_path(),
            ArtifactFile::Decoded(p) => p,
        }
    }
}

/// Strips encryption and compression layers (detected by magic bytes) into a
/// temp file under `work_dir`, then sniffs the inner format. Clear artifacts are
/// used in place.
pub fn decode_artifact(
    path: &Path,
    encryptor: &EncryptorConfig,
    work_dir: &Path,
) -> Result<DecodedArtifact> {
    let file = File::open(path)
        .map_err(Error::from)
        .with_msg(format!("Opening artifact {path:?} failed"))?;
    let (head, reader) = peek(BufReader::new(file))?;
    let was_encrypted = head.starts_with(AGE_MAGIC);
    let reader = encryptor.build_decryptor(&head, reader)?;
    let (head, reader) = peek(reader)?;
    let was_compressed = head.starts_with(XZ_MAGIC);
    let reader = build_decompressor(&head, reader);
    let (head, mut reader) = peek(reader)?;
    if head.is_empty() {
        return Err(Error::format(format!("artifact {path:?} is empty")));
    }

    let format = sniff_format(&head, path);
    let native_engine = native_engine(&head);
    let file = if was_encrypted || was_compressed {
        let mut tmp = NamedTempFile::new_in(work_dir)?;
        std::io::copy(&mut reader, &mut tmp)
            .map_err(Error::from)
            .with_msg(format!("Decoding artifact {path:?} failed"))?;
        ArtifactFile::Decoded(tmp.into_temp_path())
    } else {
        ArtifactFile::Original(path.to_path_buf())
    };

    tracing::debug!(
        "Decoded artifact {:?}: format={}, compressed={}, encrypted={}",
        path,
        format,
        was_compressed,
        was_encrypted
    );

    Ok(DecodedArtifact {
        file,
        format,
        native_engine,
        was_compressed,
        was_encrypted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::compress::xz::XzConfig;
    use crate::vault::encrypt::age::AgeEncryptorConfig;
    use tempfile::TempDir;

    #[test]
    fn test_default_formats() {
        assert_eq!(
            ArtifactFormat::default_for(Engine::Sqlite, BackupType::Full),
            ArtifactFormat::Native
        );
        assert_eq!(
            ArtifactFormat::default_for(Engine::Sqlite, BackupType::Data),
            ArtifactFormat::Interchange
        );
        assert_eq!(
            ArtifactFormat::Native.supported_by(Engine::MySql),
            ArtifactFormat::Sql
        );
    }

    #[test]
    fn test_file_name_carries_layers() {
        let dt = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z").unwrap().to_utc();
        let name = artifact_file_name(
            Engine::Postgres,
            BackupType::Full,
            ArtifactFormat::Native,
            dt,
            &CompressorConfig::Xz(XzConfig::default()),
            &EncryptorConfig::None,
        );
        assert_eq!(name, "postgres-full-20260102T030405000Z.dump.xz");
    }

    #[test]
    fn test_sniff_by_content_then_extension() {
        let p = Path::new("upload.bin");
        assert_eq!(sniff_format(b"SQLite format 3\0rest", p), ArtifactFormat::Native);
        assert_eq!(sniff_format(b"PGDMP\x01", p), ArtifactFormat::Native);
        assert_eq!(
            sniff_format(
                b"{\"format\":\"k_dbvault.interchange\",\"version\":1}\n",
                p
            ),
            ArtifactFormat::Interchange
        );
        assert_eq!(sniff_format(b"-- dump", Path::new("a.sql.xz")), ArtifactFormat::Sql);
        assert_eq!(sniff_format(b"xx", Path::new("a.sqlite3.xz.age")), ArtifactFormat::Native);
        assert_eq!(sniff_format(b"[", Path::new("a.jsonl")), ArtifactFormat::Interchange);
        assert_eq!(sniff_format(b"CREATE TABLE", Path::new("noext")), ArtifactFormat::Sql);
    }

    #[test]
    fn test_encode_decode_with_layers() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("raw.sql");
        std::fs::write(&raw, "CREATE TABLE t (id INTEGER);\n").unwrap();
        let encryptor = EncryptorConfig::Age(AgeEncryptorConfig::passphrase("layered_secret_1"));
        let out = dir.path().join("out.sql.xz.age");

        encode_artifact(&raw, &out, &CompressorConfig::Xz(XzConfig::default()), &encryptor).unwrap();
        assert!(out.exists());
        assert!(!dir.path().join("out.sql.xz.age.tmp").exists());

        let decoded = decode_artifact(&out, &encryptor, dir.path()).unwrap();
        assert!(decoded.was_encrypted && decoded.was_compressed);
        assert_eq!(decoded.format, ArtifactFormat::Sql);
        assert_eq!(
            std::fs::read_to_string(decoded.path()).unwrap(),
            "CREATE TABLE t (id INTEGER);\n"
        );
    }

    #[test]
    fn test_encode_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("raw.sql");
        let out = dir.path().join("out.sql");
        std::fs::write(&raw, "SELECT 1;").unwrap();
        std::fs::write(&out, "existing").unwrap();

        assert!(encode_artifact(&raw, &out, &CompressorConfig::None, &EncryptorConfig::None).is_err());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "existing");
    }

    #[test]
    fn test_clear_artifact_is_used_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.sql");
        std::fs::write(&path, "SELECT 1;").unwrap();
        let decoded = decode_artifact(&path, &EncryptorConfig::None, dir.path()).unwrap();
        assert_eq!(decoded.path(), path.as_path());
        assert!(!decoded.was_compressed && !decoded.was_encrypted);
    }

    #[test]
    fn test_empty_artifact_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.sql");
        std::fs::write(&path, "").unwrap();
        let err = decode_artifact(&path, &EncryptorConfig::None, dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::vault::result_error::error::ErrorKind::Format);
    }
}
