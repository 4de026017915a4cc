pub mod age;

use crate::vault::encrypt::age::AgeEncryptorConfig;
use crate::vault::file_ext::FileExtProvider;
use crate::vault::finish::Finish;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithDebugObjectAndFnName;
use ::age::stream::{StreamReader, StreamWriter};
use derive_more::From;
use io_enum::{Read, Write};
use serde::{Deserialize, Serialize};
use std::io;
use std::result;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

/// First bytes of every age file.
pub const AGE_MAGIC: &[u8] = b"age-encryption.org/v1";

#[derive(Write, From)]
pub enum Encryptor<W: io::Write> {
    None(W),
    AgeEncryptor(StreamWriter<W>),
}

#[derive(Read, From)]
pub enum Decryptor<R: io::Read> {
    None(R),
    AgeDecryptor(StreamReader<R>),
}

#[derive(Clone, Default, From, Serialize, Deserialize, Debug)]
#[serde(tag = "encryptor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum EncryptorConfig {
    #[default]
    None,
    Age(AgeEncryptorConfig),
}

impl Validate for EncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            EncryptorConfig::None => Ok(()),
            EncryptorConfig::Age(inner) => inner.validate(),
        }
    }
}

impl EncryptorConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, EncryptorConfig::None)
    }

    /// The encryptor used when a caller asks for encryption. Without a configured
    /// passphrase there is nothing to encrypt with, and the artifact stays clear.
    pub fn effective(&self, encrypt: bool) -> EncryptorConfig {
        if encrypt {
            self.clone()
        } else {
            EncryptorConfig::None
        }
    }

    /// Wraps `reader` in a decryptor when `head` carries the age header.
    pub fn build_decryptor<R: io::Read>(&self, head: &[u8], reader: R) -> Result<Decryptor<R>> {
        if !head.starts_with(AGE_MAGIC) {
            return Ok(Decryptor::None(reader));
        }
        match self {
            EncryptorConfig::None => Err(Error::format(
                "artifact is age encrypted but no passphrase is configured",
            )),
            EncryptorConfig::Age(age) => age.build_decryptor(reader),
        }
    }
}

pub trait EncryptorBuilder<W: io::Write> {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>>;
}

impl<W: io::Write> Finish<W> for Encryptor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Encryptor::None(w) => Ok(w),
            Encryptor::AgeEncryptor(w) => w.finish(),
        }
    }
}

impl<W: io::Write> EncryptorBuilder<W> for EncryptorConfig {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>> {
        match self {
            EncryptorConfig::None => Ok(writer.into()),
            EncryptorConfig::Age(age) => age.build_encryptor(writer),
        }
        .with_debug_object_and_fn_name(self.clone(), "build_encryptor")
    }
}

static AGE_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
impl FileExtProvider for EncryptorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            EncryptorConfig::None => None,
            EncryptorConfig::Age(_) => Some(AGE_FILE_EXT.get_or_init(|| "age".into()).clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encryptor_config_none() {
        let config = EncryptorConfig::None;
        assert!(config.validate().is_ok());
        assert!(config.file_ext().is_none());
        assert!(config.effective(true).is_none());
    }

    #[test]
    fn test_encryptor_config_serialization() {
        let serialized = serde_json::to_string(&EncryptorConfig::None).unwrap();
        assert_eq!(serialized, "{\"encryptor_type\":\"none\"}");
    }

    #[test]
    fn test_encrypted_artifact_without_passphrase_is_format_error() {
        let err = match EncryptorConfig::None.build_decryptor(AGE_MAGIC, Cursor::new(Vec::<u8>::new())) {
            Err(e) => e,
            Ok(_) => panic!("Expected error"),
        };
        assert_eq!(err.kind(), crate::vault::result_error::error::ErrorKind::Format);
    }

    #[test]
    fn test_clear_artifact_passes_through() {
        let decryptor = EncryptorConfig::None
            .build_decryptor(b"PGDMP", Cursor::new(b"PGDMP".to_vec()))
            .unwrap();
        assert!(matches!(decryptor, Decryptor::None(_)));
    }
}
