use crate::vault::compress::{Compressor, CompressorBuilder};
use crate::vault::result_error::result::Result;
use bon::Builder;
use liblzma::stream::{Check, MtStreamBuilder};
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use std::num::NonZero;
use validator::Validate;

/// Dumps are mostly text, a low preset already shrinks them a lot.
static DEFAULT_PRESET: u32 = 6;
static MAX_THREADS: usize = 16;

/// xz settings for compressed artifacts.
#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug, Builder)]
#[serde(deny_unknown_fields)]
pub struct XzConfig {
    /// Preset 0-9
    #[validate(range(min = 0, max = 9))]
    level: Option<u32>,
    /// Encoder threads, defaults to half the cores
    #[validate(range(min = 1))]
    thread: Option<u32>,
}

impl XzConfig {
    fn threads(&self) -> u32 {
        self.thread.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZero::get)
                .map(|core| (core / 2).clamp(1, MAX_THREADS) as u32)
                .unwrap_or(1)
        })
    }
}

impl<W: Write> CompressorBuilder<W> for XzConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_PRESET);
        let threads = self.threads();
        tracing::debug!("Compressing artifact with xz preset={level} threads={threads}");

        if threads == 1 {
            Ok(XzEncoder::new(writer, level).into())
        } else {
            let stream = MtStreamBuilder::new()
                .preset(level)
                .check(Check::Crc64)
                .threads(threads)
                .encoder()?;
            Ok(XzEncoder::new_stream(writer, stream).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_xz_config_validation() {
        assert!(XzConfig::builder().level(9).thread(2).build().validate().is_ok());
        assert!(XzConfig::builder().level(10).build().validate().is_err());
        assert!(XzConfig::builder().thread(0).build().validate().is_err());
    }

    #[test]
    fn test_threads_default_is_positive() {
        assert!(XzConfig::default().threads() >= 1);
        assert_eq!(XzConfig::builder().thread(3).build().threads(), 3);
    }

    #[test]
    fn test_build_single_and_multi_thread() {
        for thread in [1, 2] {
            let config = XzConfig::builder().level(1).thread(thread).build();
            match config.build_compressor(Cursor::new(Vec::new())).unwrap() {
                Compressor::XzEncoder(_) => (),
                _ => panic!("Expected XzEncoder"),
            }
        }
    }

    #[test]
    fn test_xz_config_yaml() {
        let config: XzConfig = serde_yml::from_str("level: 3\nthread: 2\n").unwrap();
        assert_eq!(config.level, Some(3));
        assert_eq!(config.thread, Some(2));
        assert!(serde_yml::from_str::<XzConfig>("levels: 3\n").is_err());
    }
}
