//! Firmware image decoding.
//!
//! An [`Image`] is the ordered list of RAM writes needed to upload a firmware file into the
//! controller. Each record is small enough to be written with a single control transfer.
//!
//! [`Image`]: struct.Image.html

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use crate::{Error, Result};

/// Maximum payload of a single RAM write.
pub const MAX_RECORD_LEN: usize = 1023;

/// Supported firmware file formats.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ImageFormat {
    /// Intel HEX (`.hex`, `.ihx`).
    Hex,
    /// FX2 boot EEPROM image (`.iic`).
    Iic,
    /// Raw binary loaded at address 0 (`.bix`).
    Bix,
}

impl ImageFormat {
    /// Guesses the format of a file from its extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("hex") | Some("ihx") => Ok(ImageFormat::Hex),
            Some("iic") => Ok(ImageFormat::Iic),
            Some("bix") => Ok(ImageFormat::Bix),
            _ => Err(Error::firmware(format!(
                "{} is not a recognized image type",
                path.display()
            ))),
        }
    }
}

/// A single write of `data` to RAM starting at `address`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Record {
    pub address: u32,
    pub data: Vec<u8>,
}

/// A decoded firmware image.
#[derive(Debug, Clone)]
pub struct Image {
    name: String,
    records: Vec<Record>,
}

impl Image {
    /// Reads and decodes a firmware file, choosing the format by extension.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = ImageFormat::from_path(path)?;
        let file = File::open(path).map_err(|e| {
            Error::new(
                crate::ErrorKind::Firmware,
                format!("{}: {}", path.display(), e),
            )
        })?;
        let image = Self::parse(path.display().to_string(), format, BufReader::new(file))?;
        log::info!(
            "{}: {:?} image, {} records, {} bytes",
            image.name,
            format,
            image.records.len(),
            image.len()
        );
        Ok(image)
    }

    /// Decodes an image of the given format from `reader`.
    ///
    /// `name` is used in diagnostics.
    ///
    /// # Examples
    ///
    /// ```
    /// use fx2stream::{Image, ImageFormat};
    ///
    /// let hex = ":0300000002000BF0\n:00000001FF\n";
    /// let image = Image::parse("blink.hex", ImageFormat::Hex, hex.as_bytes())?;
    /// assert_eq!(image.records()[0].address, 0);
    /// assert_eq!(image.records()[0].data, [0x02, 0x00, 0x0b]);
    /// # Ok::<(), fx2stream::Error>(())
    /// ```
    pub fn parse(name: impl Into<String>, format: ImageFormat, reader: impl BufRead) -> Result<Self> {
        let name = name.into();
        let records = match format {
            ImageFormat::Hex => parse_hex(reader),
            ImageFormat::Iic => parse_iic(reader),
            ImageFormat::Bix => parse_bix(reader),
        }
        .map_err(|e| e.context(crate::ErrorKind::Firmware, &name))?;

        Ok(Self { name, records })
    }

    /// Creates an image from already decoded records.
    pub fn from_records(name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }

    /// Returns the name of the image (usually its path).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the RAM writes in upload order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Returns the total payload size in bytes.
    pub fn len(&self) -> usize {
        self.records.iter().map(|r| r.data.len()).sum()
    }

    /// Returns whether the image contains no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_err(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::firmware("unexpected end of file")
    } else {
        Error::io(e)
    }
}

fn parse_hex(reader: impl BufRead) -> Result<Vec<Record>> {
    let mut records = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(Error::io)?;
        let line = line.trim();
        let lineno = i + 1;
        if line.is_empty() {
            continue;
        }

        let digits = line.strip_prefix(':').ok_or_else(|| {
            Error::firmware(format!("line {}: missing record start code", lineno))
        })?;
        if digits.len() % 2 != 0 || digits.len() < 10 {
            return Err(Error::firmware(format!("line {}: malformed record", lineno)));
        }
        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| Error::firmware(format!("line {}: invalid hex digit", lineno)))?;

        let len = usize::from(bytes[0]);
        if bytes.len() != len + 5 {
            return Err(Error::firmware(format!(
                "line {}: record length {} does not match line length",
                lineno, len
            )));
        }
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(Error::firmware(format!("line {}: bad checksum", lineno)));
        }

        let address = u32::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        match bytes[3] {
            0x00 => {
                if len > 0 {
                    records.push(Record {
                        address,
                        data: bytes[4..4 + len].to_vec(),
                    });
                }
            }
            0x01 => return Ok(records),
            ty => {
                return Err(Error::firmware(format!(
                    "line {}: unsupported record type {:02x}",
                    lineno, ty
                )))
            }
        }
    }

    Err(Error::firmware("missing end-of-file record"))
}

fn parse_iic(mut reader: impl Read) -> Result<Vec<Record>> {
    let mut header = [0; 8];
    reader.read_exact(&mut header).map_err(read_err)?;
    if header[0] != 0xc2 {
        return Err(Error::firmware(format!(
            "not a firmware EEPROM image (header byte 0x{:02x})",
            header[0]
        )));
    }

    let mut records = Vec::new();
    loop {
        let mut block = [0; 4];
        reader.read_exact(&mut block).map_err(read_err)?;
        if block[0] & 0x80 != 0 {
            // The final block resets the CPU, which the loader does on its own.
            return Ok(records);
        }

        let len = usize::from(u16::from_be_bytes([block[0], block[1]]) & 0x03ff);
        let address = u32::from(u16::from_be_bytes([block[2], block[3]]));
        let mut data = vec![0; len];
        reader.read_exact(&mut data).map_err(read_err)?;
        records.push(Record { address, data });
    }
}

fn parse_bix(mut reader: impl Read) -> Result<Vec<Record>> {
    let mut contents = Vec::new();
    reader.read_to_end(&mut contents).map_err(Error::io)?;

    Ok(contents
        .chunks(MAX_RECORD_LEN)
        .enumerate()
        .map(|(i, chunk)| Record {
            address: (i * MAX_RECORD_LEN) as u32,
            data: chunk.to_vec(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn format_from_extension() {
        assert_eq!(
            ImageFormat::from_path(Path::new("fw/fx2pipe.ihx")).unwrap(),
            ImageFormat::Hex
        );
        assert_eq!(
            ImageFormat::from_path(Path::new("FW.HEX")).unwrap(),
            ImageFormat::Hex
        );
        assert_eq!(
            ImageFormat::from_path(Path::new("boot.iic")).unwrap(),
            ImageFormat::Iic
        );
        assert_eq!(
            ImageFormat::from_path(Path::new("ram.bix")).unwrap(),
            ImageFormat::Bix
        );
        assert!(ImageFormat::from_path(Path::new("fx3.img")).is_err());
        assert!(ImageFormat::from_path(Path::new("noext")).is_err());
    }

    #[test]
    fn hex_records() {
        let hex = "\
:0300000002000BF0
:0400100012345678D8

:00000001FF
:0100200099FF46
";
        let image = Image::parse("t.hex", ImageFormat::Hex, hex.as_bytes()).unwrap();
        assert_eq!(
            image.records(),
            &[
                Record {
                    address: 0x0000,
                    data: vec![0x02, 0x00, 0x0b]
                },
                Record {
                    address: 0x0010,
                    data: vec![0x12, 0x34, 0x56, 0x78]
                },
            ]
        );
        assert_eq!(image.len(), 7);
        assert_eq!(image.name(), "t.hex");
    }

    #[test]
    fn hex_bad_checksum() {
        let hex = ":0300000002000BF1\n:00000001FF\n";
        let err = Image::parse("t.hex", ImageFormat::Hex, hex.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Firmware);
        assert!(err.to_string().contains("t.hex"));
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn hex_missing_eof() {
        let hex = ":0300000002000BF0\n";
        assert!(Image::parse("t.hex", ImageFormat::Hex, hex.as_bytes()).is_err());
    }

    #[test]
    fn hex_extended_address_unsupported() {
        let hex = ":020000040001F9\n:00000001FF\n";
        let err = Image::parse("t.hex", ImageFormat::Hex, hex.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("record type 04"));
    }

    #[test]
    fn iic_blocks() {
        let mut iic = vec![0xc2, 0xb4, 0x04, 0x13, 0x86, 0x00, 0x00, 0x00];
        iic.extend_from_slice(&[0x00, 0x02, 0x00, 0x80, 0xaa, 0xbb]);
        iic.extend_from_slice(&[0x00, 0x01, 0xe0, 0x00, 0xcc]);
        iic.extend_from_slice(&[0x80, 0x01, 0xe6, 0x00, 0x00]);

        let image = Image::parse("t.iic", ImageFormat::Iic, &iic[..]).unwrap();
        assert_eq!(
            image.records(),
            &[
                Record {
                    address: 0x0080,
                    data: vec![0xaa, 0xbb]
                },
                Record {
                    address: 0xe000,
                    data: vec![0xcc]
                },
            ]
        );
    }

    #[test]
    fn iic_truncated() {
        let iic = [0xc2, 0xb4, 0x04, 0x13, 0x86, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x01];
        let err = Image::parse("t.iic", ImageFormat::Iic, &iic[..]).unwrap_err();
        assert!(err.to_string().contains("unexpected end of file"));
    }

    #[test]
    fn iic_wrong_header() {
        let iic = [0xc0, 0xb4, 0x04, 0x13, 0x86, 0x00, 0x00, 0x00];
        assert!(Image::parse("t.iic", ImageFormat::Iic, &iic[..]).is_err());
    }

    #[test]
    fn bix_is_chunked() {
        let bin = vec![0x5a; MAX_RECORD_LEN * 2 + 10];
        let image = Image::parse("t.bix", ImageFormat::Bix, &bin[..]).unwrap();
        let records = image.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].address, MAX_RECORD_LEN as u32);
        assert_eq!(records[2].data.len(), 10);
        assert_eq!(image.len(), bin.len());
    }
}
