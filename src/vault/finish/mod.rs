use age::stream::StreamWriter;
use liblzma::write::XzEncoder;
use std::io::{Error, Write};

pub trait Finish<O> {
    fn finish(self) -> Result<O, Error>;
}

impl<W: Write> Finish<W> for StreamWriter<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for XzEncoder<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_xz_encoder_finish_impl() {
        let mut encoder = XzEncoder::new(Cursor::new(Vec::new()), 1);
        encoder.write_all(b"payload").unwrap();
        let cursor = Finish::finish(encoder).unwrap();
        assert!(!cursor.into_inner().is_empty());
    }
}
