
//! A minimal stream envelope for storing encoded frames in a file:
//! a magic number, the stream parameters, then length-prefixed wire
//! packets. Network transports will usually frame packets themselves
//! and skip this module entirely.

use crate::config::{ChromaSiting, ChromaSubsampling, CodecConfig, YcbcrRange};
use crate::error::{Error, Result, UnitResult};
use crate::io::{Data, Read, Write};

/// The eight bytes opening every stream.
pub const MAGIC: &[u8; 8] = b"PYROWAVE";

/// Caps a length-prefixed packet read so a corrupt
/// prefix cannot trigger a huge allocation.
const MAX_PACKET_BYTES: usize = 1 << 26;

/// The stream parameters stored after the magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {

    /// Frame width in luma samples.
    pub width: i32,

    /// Frame height in luma samples.
    pub height: i32,

    /// Source pixel layout tag of the producing tool, zero for planar YCbCr.
    pub yuv_format: i32,

    /// Zero for 4:2:0, one for 4:4:4.
    pub chroma: i32,

    /// Whether the samples use full range codes.
    pub is_full_range: i32,

    /// Frame rate numerator.
    pub frame_rate_numerator: i32,

    /// Frame rate denominator.
    pub frame_rate_denominator: i32,

    /// Zero for centered chroma siting, one for left siting.
    pub siting: i32,
}

impl StreamHeader {

    /// Derive the envelope parameters of a session at the given frame rate.
    pub fn from_config(config: &CodecConfig, frame_rate: (i32, i32)) -> Self {
        StreamHeader {
            width: config.width as i32,
            height: config.height as i32,
            yuv_format: 0,
            chroma: config.chroma.to_wire() as i32,
            is_full_range: (config.color.range == YcbcrRange::Full) as i32,
            frame_rate_numerator: frame_rate.0,
            frame_rate_denominator: frame_rate.1,
            siting: (config.color.siting == ChromaSiting::Left) as i32,
        }
    }

    /// The chroma subsampling the stream declares.
    pub fn chroma_subsampling(&self) -> ChromaSubsampling {
        ChromaSubsampling::from_wire(self.chroma as u32)
    }

    /// Write the magic number and the parameters.
    pub fn write(&self, write: &mut impl Write) -> UnitResult {
        u8::write_slice(write, MAGIC)?;

        for parameter in [
            self.width, self.height, self.yuv_format, self.chroma,
            self.is_full_range, self.frame_rate_numerator,
            self.frame_rate_denominator, self.siting,
        ] {
            parameter.write(write)?;
        }

        Ok(())
    }

    /// Read the magic number and the parameters.
    pub fn read(read: &mut impl Read) -> Result<Self> {
        let mut magic = [0_u8; 8];
        u8::read_slice(read, &mut magic)?;

        if &magic != MAGIC {
            return Err(Error::malformed("not a pyrowave stream"));
        }

        let mut parameters = [0_i32; 8];
        i32::read_slice(read, &mut parameters)?;

        let header = StreamHeader {
            width: parameters[0],
            height: parameters[1],
            yuv_format: parameters[2],
            chroma: parameters[3],
            is_full_range: parameters[4],
            frame_rate_numerator: parameters[5],
            frame_rate_denominator: parameters[6],
            siting: parameters[7],
        };

        if header.width <= 0 || header.height <= 0 {
            return Err(Error::malformed("stream dimensions"));
        }

        Ok(header)
    }
}

/// Append one wire packet with its length prefix.
pub fn write_packet(write: &mut impl Write, packet: &[u8]) -> UnitResult {
    (packet.len() as u32).write(write)?;
    u8::write_slice(write, packet)?;
    Ok(())
}

/// Read the next length-prefixed wire packet,
/// or `None` at a clean end of stream.
pub fn read_packet(read: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let size = match u32::read(read) {
        Ok(size) => size as usize,
        Err(Error::Malformed(_)) => return Ok(None), // clean end of stream
        Err(other) => return Err(other),
    };

    if size > MAX_PACKET_BYTES {
        return Err(Error::malformed("unreasonable packet size"));
    }

    let mut packet = vec![0_u8; size];
    u8::read_slice(read, &mut packet)?;
    Ok(Some(packet))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_stream(){
        let config = CodecConfig::new(1920, 1088, ChromaSubsampling::Chroma420);
        let header = StreamHeader::from_config(&config, (60, 1));

        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        write_packet(&mut bytes, &[ 1, 2, 3, 4 ]).unwrap();
        write_packet(&mut bytes, &[ 5 ]).unwrap();

        let mut read = Cursor::new(bytes);
        let restored = StreamHeader::read(&mut read).unwrap();
        assert_eq!(restored, header);
        assert_eq!(restored.chroma_subsampling(), ChromaSubsampling::Chroma420);

        assert_eq!(read_packet(&mut read).unwrap(), Some(vec![ 1, 2, 3, 4 ]));
        assert_eq!(read_packet(&mut read).unwrap(), Some(vec![ 5 ]));
        assert_eq!(read_packet(&mut read).unwrap(), None);
    }

    #[test]
    fn rejects_foreign_streams(){
        let mut read = Cursor::new(b"NOTAWAVE________".to_vec());
        assert!(StreamHeader::read(&mut read).is_err());
    }
}
