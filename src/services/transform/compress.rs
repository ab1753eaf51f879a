use super::StageWriter;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::{self, Write};
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, StreamWriter, ZipWriter};

const ZIP_LEVEL: i64 = 5;

/// Single-entry deflate archive written without seeking.
pub struct ZipStage<W: Write> {
    zip: ZipWriter<StreamWriter<W>>,
}

impl<W: Write> ZipStage<W> {
    pub fn new(inner: W, entry_name: &str) -> io::Result<Self> {
        let mut zip = ZipWriter::new_stream(inner);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(ZIP_LEVEL));
        zip.start_file(entry_name, options).map_err(io::Error::other)?;
        Ok(Self { zip })
    }
}

impl<W: Write> Write for ZipStage<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.zip.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.zip.flush()
    }
}

impl<W: Write> StageWriter for ZipStage<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = self.zip.finish().map_err(io::Error::other)?.into_inner();
        inner.flush()
    }
}

impl<W: Write> StageWriter for GzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        GzEncoder::finish(*self)?.flush()
    }
}

pub fn gzip<W: Write>(inner: W) -> GzEncoder<W> {
    GzEncoder::new(inner, Compression::default())
}

/// Pass-through stage.
pub struct Identity<W: Write>(pub W);

impl<W: Write> Write for Identity<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> StageWriter for Identity<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}
