//! Secret string handling with redacted display and serialization.
//!
//! Database passwords, encryption passphrases and administrator passwords all go
//! through `RedactedString` so they never leak into logs, job logs or `Debug` output.

use bon::Builder;
use derive_more::From;
use getset::Getters;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Formatter};
use std::result;
use zeroize::Zeroize;

/// Placeholder text shown instead of the actual secret
pub static REDACTED: &str = "###REDACTED###";

/// A string that is redacted in debug output and by the default serializer.
///
/// Zeroes its memory on drop. Files that must persist the real value (the
/// connection settings file) opt in with [`expose_secret`].
#[derive(Clone, Zeroize, From, Builder, PartialEq, Eq, Getters, Default)]
#[getset(get = "pub")]
pub struct RedactedString {
    #[builder(into)]
    inner: String,
}

impl RedactedString {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self { inner: s.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl From<&str> for RedactedString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Debug for RedactedString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", REDACTED)
    }
}

impl Serialize for RedactedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for RedactedString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(RedactedStringVisitor)
    }
}

impl Drop for RedactedString {
    fn drop(&mut self) {
        self.zeroize();
    }
}

pub struct RedactedStringVisitor;

impl Visitor<'_> for RedactedStringVisitor {
    type Value = RedactedString;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a string")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(RedactedString::new(v))
    }
}

/// Serializer for fields that must keep the clear value on disk,
/// used as `#[serde(serialize_with = "expose_secret")]`.
pub fn expose_secret<S: Serializer>(
    value: &Option<RedactedString>,
    serializer: S,
) -> result::Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_some(v.inner.as_str()),
        None => serializer.serialize_none(),
    }
}
