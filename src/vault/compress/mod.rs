pub mod xz;

use crate::vault::file_ext::FileExtProvider;
use crate::vault::finish::Finish;
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithDebugObjectAndFnName;
use derive_more::From;
use io_enum::{Read, Write};
use liblzma::read::XzDecoder;
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use std::io;
use std::result;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

/// xz stream magic bytes.
pub const XZ_MAGIC: &[u8] = &[0xFD, b'7', b'z', b'X', b'Z', 0x00];

#[derive(Write, From)]
pub enum Compressor<W: io::Write> {
    None(W),
    XzEncoder(XzEncoder<W>),
}

#[derive(Read, From)]
pub enum Decompressor<R: io::Read> {
    None(R),
    XzDecoder(XzDecoder<R>),
}

#[derive(Clone, Default, From, Serialize, Deserialize, Debug)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    #[default]
    None,
    Xz(xz::XzConfig),
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Xz(xz) => xz.validate(),
        }
    }
}

impl CompressorConfig {
    /// The compressor used when a caller asks for compression: the configured one,
    /// or xz with default settings when the config says `none`.
    pub fn effective(&self, compress: bool) -> CompressorConfig {
        match (compress, self) {
            (false, _) => CompressorConfig::None,
            (true, CompressorConfig::None) => CompressorConfig::Xz(xz::XzConfig::default()),
            (true, c) => c.clone(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, CompressorConfig::None)
    }
}

pub trait CompressorBuilder<W: io::Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: io::Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::XzEncoder(w) => w.finish(),
        }
    }
}

impl<W: io::Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Xz(xz) => xz.build_compressor(writer),
        }
        .with_debug_object_and_fn_name(self.clone(), "build_compressor")
    }
}

/// Wraps `reader` in an xz decoder when it starts with the xz magic.
/// `head` is the already sniffed prefix of the stream.
pub fn build_decompressor<R: io::Read>(head: &[u8], reader: R) -> Decompressor<R> {
    if head.starts_with(XZ_MAGIC) {
        tracing::debug!("Artifact is xz compressed");
        XzDecoder::new_multi_decoder(reader).into()
    } else {
        Decompressor::None(reader)
    }
}

static XZ_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Xz(_) => Some(XZ_FILE_EXT.get_or_init(|| "xz".into()).clone()),
        }
    }
}
