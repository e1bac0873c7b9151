//! Just enough ABI to read the voting contract: 32-byte words, dynamic
//! strings, string arrays and uint arrays. Topic hashes are precomputed
//! keccak-256 of the canonical event signatures.

use super::{PollAggregate, PollCreatedEvent, SourceError, VoteCastEvent};

// keccak256("PollCreated(uint256,string,string[])")
pub const POLL_CREATED_TOPIC: &str =
    "0x4be3f505bf50604bde92e6940e2df40c36f90cb362640413d520080ca12eabb2";
// keccak256("VoteCasted(uint256,uint256,address)")
pub const VOTE_CASTED_TOPIC: &str =
    "0xfe9b9fe32c3fe66775687ffbbb055de4489a6f99a6d31665430849156e8d7435";
// First four bytes of keccak256("getPoll(uint256)")
pub const GET_POLL_SELECTOR: &str = "0x1a8cbcaa";

const WORD: usize = 32;

pub fn encode_get_poll_call(poll_id: u64) -> String {
    format!("{GET_POLL_SELECTOR}{poll_id:064x}")
}

pub fn parse_hex_u64(quantity: &str) -> Result<u64, SourceError> {
    let digits = quantity.strip_prefix("0x").unwrap_or(quantity);
    u64::from_str_radix(digits, 16)
        .map_err(|e| SourceError::Malformed(format!("bad hex quantity '{quantity}': {e}")))
}

fn decode_hex(data: &str) -> Result<Vec<u8>, SourceError> {
    let digits = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(digits).map_err(|e| SourceError::Malformed(format!("bad hex data: {e}")))
}

// An indexed uint256 event parameter, delivered as a 32-byte topic.
fn topic_u64(topics: &[String], index: usize) -> Result<u64, SourceError> {
    let topic = topics
        .get(index)
        .ok_or_else(|| SourceError::Malformed(format!("missing topic {index}")))?;
    let bytes = decode_hex(topic)?;
    uint_word(&bytes, 0)
}

fn word_at(bytes: &[u8], offset: usize) -> Result<&[u8], SourceError> {
    bytes.get(offset..offset + WORD).ok_or_else(|| {
        SourceError::Malformed(format!(
            "word at offset {offset} out of bounds (len {})",
            bytes.len()
        ))
    })
}

// A uint256 word narrowed to u64; anything wider is rejected, not truncated.
fn uint_word(bytes: &[u8], offset: usize) -> Result<u64, SourceError> {
    let word = word_at(bytes, offset)?;
    if word[..WORD - 8].iter().any(|&b| b != 0) {
        return Err(SourceError::Malformed(format!(
            "uint256 at offset {offset} exceeds u64"
        )));
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[WORD - 8..]);
    Ok(u64::from_be_bytes(tail))
}

fn usize_word(bytes: &[u8], offset: usize) -> Result<usize, SourceError> {
    usize::try_from(uint_word(bytes, offset)?)
        .map_err(|_| SourceError::Malformed(format!("value at offset {offset} exceeds usize")))
}

// Dynamic string: length word followed by padded UTF-8 bytes.
fn string_at(bytes: &[u8], offset: usize) -> Result<String, SourceError> {
    let len = usize_word(bytes, offset)?;
    let start = offset + WORD;
    let raw = bytes
        .get(start..start + len)
        .ok_or_else(|| SourceError::Malformed(format!("string at offset {offset} truncated")))?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| SourceError::Malformed(format!("string at offset {offset} not utf-8: {e}")))
}

// string[]: count word, then per-element offsets relative to the start of
// the element area, each pointing at a dynamic string.
fn string_array_at(bytes: &[u8], offset: usize) -> Result<Vec<String>, SourceError> {
    let count = usize_word(bytes, offset)?;
    let base = offset + WORD;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let rel = usize_word(bytes, base + i * WORD)?;
        out.push(string_at(bytes, base + rel)?);
    }
    Ok(out)
}

fn uint_array_at(bytes: &[u8], offset: usize) -> Result<Vec<u64>, SourceError> {
    let count = usize_word(bytes, offset)?;
    let base = offset + WORD;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(uint_word(bytes, base + i * WORD)?);
    }
    Ok(out)
}

// PollCreated(uint256 indexed pollId, string question, string[] options):
// pollId rides in topic 1, the rest is in the data section.
pub fn decode_poll_created(
    topics: &[String],
    data: &str,
    position: u64,
) -> Result<PollCreatedEvent, SourceError> {
    let poll_id = topic_u64(topics, 1)?;
    let bytes = decode_hex(data)?;
    let question_off = usize_word(&bytes, 0)?;
    let options_off = usize_word(&bytes, WORD)?;
    Ok(PollCreatedEvent {
        poll_id,
        question: string_at(&bytes, question_off)?,
        options: string_array_at(&bytes, options_off)?,
        position,
    })
}

// VoteCasted(uint256 indexed pollId, uint256 optionIndex, address voter):
// two static words in the data section.
pub fn decode_vote_casted(
    topics: &[String],
    data: &str,
    position: u64,
) -> Result<VoteCastEvent, SourceError> {
    let poll_id = topic_u64(topics, 1)?;
    let bytes = decode_hex(data)?;
    let option_index = uint_word(&bytes, 0)?;
    let voter_word = word_at(&bytes, WORD)?;
    Ok(VoteCastEvent {
        poll_id,
        option_index,
        voter: format!("0x{}", hex::encode(&voter_word[WORD - 20..])),
        position,
    })
}

// getPoll(uint256) returns (uint256, string, string[], uint256[]).
pub fn decode_get_poll_return(data: &str) -> Result<PollAggregate, SourceError> {
    let bytes = decode_hex(data)?;
    let poll_id = uint_word(&bytes, 0)?;
    let question_off = usize_word(&bytes, WORD)?;
    let options_off = usize_word(&bytes, 2 * WORD)?;
    let votes_off = usize_word(&bytes, 3 * WORD)?;
    Ok(PollAggregate {
        poll_id,
        question: string_at(&bytes, question_off)?,
        options: string_array_at(&bytes, options_off)?,
        votes: uint_array_at(&bytes, votes_off)?,
    })
}
