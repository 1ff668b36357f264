
//! The packet ingestor.
//!
//! Parses arriving wire packets, tracks the frame sequence, and stages
//! block payloads for the dequantizer. A wire packet holds one or more
//! headers back to back, usually a sequence header followed by block
//! packets.
//!
//! Ingestion is transactional: the whole packet is structurally validated
//! before any state changes, so a malformed packet leaves the decoder
//! untouched. Stale sequences and duplicated blocks are recoverable wire
//! events and are skipped with a warning instead of failing.

use crate::bitstream::{
    check_block_packet, sequence_is_stale, word_is_extended, word_sequence,
    BlockHeader, SequenceHeader, HEADER_WORDS, START_OF_FRAME,
};
use crate::error::{Error, UnitResult};
use crate::io::words_from_le_bytes;

use super::{Decoder, MISSING_BLOCK};

impl Decoder {

    /// Ingest one wire packet.
    ///
    /// Returns a [`crate::error::Error::Malformed`] error and changes
    /// nothing if the packet is structurally broken. Packets of a stale
    /// sequence are dropped silently.
    pub fn push_packet(&mut self, data: &[u8]) -> UnitResult {
        if data.len() % 4 != 0 {
            return Err(Error::malformed("wire packets are whole words"));
        }

        let words = words_from_le_bytes(data);
        self.validate_wire_packet(&words)?;

        let mut cursor = 0;
        while cursor < words.len() {
            let sequence = word_sequence(words[cursor]);

            if let Some(last) = self.last_sequence {
                if sequence_is_stale(last, sequence) {
                    // all headers in a packet share a sequence
                    log::warn!("backwards sequence detected, discarding");
                    return Ok(());
                }
            }

            if word_is_extended(words[cursor]) {
                let header = SequenceHeader::unpack([ words[cursor], words[cursor + 1] ]);
                self.adopt_sequence(sequence);
                self.total_blocks_in_sequence = header.total_blocks as usize;
                cursor += HEADER_WORDS;
            }
            else {
                let header = BlockHeader::unpack([ words[cursor], words[cursor + 1] ]);
                self.adopt_sequence(sequence);

                let payload_words = header.payload_words as usize;
                self.stage_block(&header, &words[cursor .. cursor + payload_words]);
                cursor += payload_words;
            }
        }

        Ok(())
    }

    /// Structurally validate a whole wire packet without changing state.
    fn validate_wire_packet(&self, words: &[u32]) -> UnitResult {
        let config = self.buffers.config();
        let mut cursor = 0;

        while cursor < words.len() {
            if cursor + HEADER_WORDS > words.len() {
                return Err(Error::malformed("truncated header at the end of a wire packet"));
            }

            if word_is_extended(words[cursor]) {
                let header = SequenceHeader::unpack([ words[cursor], words[cursor + 1] ]);

                if header.code != START_OF_FRAME {
                    return Err(Error::malformed("unrecognized extended header code"));
                }

                if header.width != config.width || header.height != config.height {
                    log::error!(
                        "dimension mismatch in sequence packet, ({}, {}) != ({}, {})",
                        header.width, header.height, config.width, config.height
                    );
                    return Err(Error::malformed("sequence header dimensions do not match the session"));
                }

                if header.chroma != config.chroma {
                    return Err(Error::malformed("sequence header chroma does not match the session"));
                }

                cursor += HEADER_WORDS;
            }
            else {
                let header = BlockHeader::unpack([ words[cursor], words[cursor + 1] ]);
                let payload_words = header.payload_words as usize;

                if cursor + payload_words > words.len() {
                    log::error!(
                        "packet header states {} words, but only {} left to parse",
                        payload_words, words.len() - cursor
                    );
                    return Err(Error::malformed("payload exceeds the wire packet"));
                }

                check_block_packet(&words[cursor .. cursor + payload_words], &self.buffers)?;
                cursor += payload_words;
            }
        }

        Ok(())
    }

    /// Stage one structurally valid block packet for the dequantizer.
    fn stage_block(&mut self, header: &BlockHeader, packet: &[u32]) {
        let block = header.block_index as usize;

        if self.dequant_offset[block] != MISSING_BLOCK {
            log::warn!("block_index {} is already decoded, skipping", block);
            return;
        }

        self.dequant_offset[block] = self.payload.len() as u32;
        self.payload.extend_from_slice(packet);
        self.decoded_blocks += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{ChromaSubsampling, CodecConfig};
    use crate::device::Device;
    use crate::decode::DecodeState;
    use crate::io::words_to_le_bytes;

    fn decoder() -> Decoder {
        let device = Device::software().unwrap();
        let config = CodecConfig::new(128, 128, ChromaSubsampling::Chroma444);
        Decoder::init(&device, config).unwrap()
    }

    fn sequence_packet(sequence: u8, total_blocks: u32) -> Vec<u8> {
        let header = SequenceHeader {
            width: 128, height: 128, sequence, total_blocks,
            code: START_OF_FRAME,
            chroma: ChromaSubsampling::Chroma444,
            color: Default::default(),
        };

        let mut bytes = Vec::new();
        words_to_le_bytes(&header.pack(), &mut bytes);
        bytes
    }

    #[test]
    fn adopts_sequences_in_order(){
        let mut decoder = decoder();

        decoder.push_packet(&sequence_packet(5, 10)).unwrap();
        assert_eq!(decoder.last_sequence, Some(5));
        assert_eq!(decoder.total_blocks_in_sequence, 10);
        assert_eq!(decoder.state(), DecodeState::SequenceAdopted);

        // the next frame replaces the state
        decoder.push_packet(&sequence_packet(6, 7)).unwrap();
        assert_eq!(decoder.last_sequence, Some(6));
        assert_eq!(decoder.total_blocks_in_sequence, 7);
    }

    #[test]
    fn stale_sequence_is_dropped_silently(){
        let mut decoder = decoder();

        decoder.push_packet(&sequence_packet(5, 10)).unwrap();

        // delta (2 - 5) mod 8 = 5 is stale: silently dropped
        decoder.push_packet(&sequence_packet(2, 99)).unwrap();
        assert_eq!(decoder.last_sequence, Some(5));
        assert_eq!(decoder.total_blocks_in_sequence, 10);

        // delta 4 is not stale and adopts
        decoder.push_packet(&sequence_packet(1, 3)).unwrap();
        assert_eq!(decoder.last_sequence, Some(1));
    }

    #[test]
    fn dimension_mismatch_is_rejected(){
        let mut decoder = decoder();

        let header = SequenceHeader {
            width: 256, height: 128, sequence: 1, total_blocks: 0,
            code: START_OF_FRAME,
            chroma: ChromaSubsampling::Chroma444,
            color: Default::default(),
        };

        let mut bytes = Vec::new();
        words_to_le_bytes(&header.pack(), &mut bytes);

        assert!(decoder.push_packet(&bytes).is_err());
        assert_eq!(decoder.last_sequence, None, "state must stay untouched");
    }

    #[test]
    fn truncated_packets_are_rejected(){
        let mut decoder = decoder();

        assert!(decoder.push_packet(&[ 0, 1, 2 ]).is_err());
        assert!(decoder.push_packet(&sequence_packet(1, 0)[.. 4]).is_err());
        assert_eq!(decoder.last_sequence, None);
    }

    #[test]
    fn oversized_block_payload_is_rejected(){
        let mut decoder = decoder();
        decoder.push_packet(&sequence_packet(1, 5)).unwrap();

        // a block header declaring more words than the packet holds
        let header = BlockHeader {
            ballot: 1,
            payload_words: 100,
            sequence: 1,
            quant_code: 0,
            block_index: 0,
        };

        let mut bytes = Vec::new();
        words_to_le_bytes(&header.pack(), &mut bytes);

        assert!(decoder.push_packet(&bytes).is_err());
        assert_eq!(decoder.decoded_blocks, 0);
        assert_eq!(decoder.total_blocks_in_sequence, 5, "state must stay untouched");
    }
}
