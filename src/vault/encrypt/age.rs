use crate::vault::encrypt::{Decryptor, Encryptor, EncryptorBuilder};
use crate::vault::redacted::RedactedString;
use crate::vault::result_error::result::Result;
use age::secrecy::SecretString;
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::result;
use validator::{Validate, ValidationError, ValidationErrors};

static MIN_PASSPHRASE_LEN: usize = 8;

/// age encryption of backup artifacts. Only passphrase (scrypt) recipients are
/// supported so that a restore needs nothing but the vault config.
#[derive(From, Clone, Deserialize, Serialize, Debug)]
#[serde(tag = "secret_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum AgeEncryptorConfig {
    Passphrase { passphrase: RedactedString },
}

impl AgeEncryptorConfig {
    pub fn passphrase<S: Into<String>>(passphrase: S) -> Self {
        AgeEncryptorConfig::Passphrase {
            passphrase: RedactedString::new(passphrase),
        }
    }

    fn secret(&self) -> SecretString {
        match self {
            AgeEncryptorConfig::Passphrase { passphrase } => {
                SecretString::from(passphrase.inner().to_owned())
            }
        }
    }

    pub fn build_decryptor<R: Read>(&self, reader: R) -> Result<Decryptor<R>> {
        tracing::debug!("Decrypting age artifact with configured passphrase");
        let decryptor = age::Decryptor::new(reader)?;
        let identity = age::scrypt::Identity::new(self.secret());
        Ok(decryptor
            .decrypt(std::iter::once(&identity as &dyn age::Identity))?
            .into())
    }
}

impl<W: Write> EncryptorBuilder<W> for AgeEncryptorConfig {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>> {
        tracing::debug!("Encrypting artifact with age passphrase");
        Ok(age::Encryptor::with_user_passphrase(self.secret())
            .wrap_output(writer)?
            .into())
    }
}

impl Validate for AgeEncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            AgeEncryptorConfig::Passphrase { passphrase } => {
                if passphrase.inner().chars().count() < MIN_PASSPHRASE_LEN {
                    let mut errors = ValidationErrors::new();
                    errors.add(
                        "passphrase",
                        ValidationError::new("length").with_message(
                            format!("passphrase needs at least {MIN_PASSPHRASE_LEN} characters")
                                .into(),
                        ),
                    );
                    return Err(errors);
                }
                Ok(())
            }
        }
    }
}
