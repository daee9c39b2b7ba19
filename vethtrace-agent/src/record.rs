//! Decoder for raw probe records
//!
//! Header fields arrive HPACK-compressed in fixed-size, NUL-padded buffers.
//! Only the value of the last header field in a block is kept: the probe
//! emits one field per block and downstream consumers expect a single value.

use crate::error::DecodeError;
use log::warn;
use std::net::Ipv4Addr;
use vethtrace_common::{layout, HEADER_TABLE_CAPACITY};

/// One decoded traffic record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    pub phase: u32,
    pub destination_address: Ipv4Addr,
    pub destination_port: u16,
    pub source_address: Ipv4Addr,
    pub source_port: u16,
    pub sequence: u16,
    pub duration_ticks: u32,
    pub process_id: u32,
    pub path_len: u8,
    pub path: String,
    pub status: String,
}

/// Decode a raw probe buffer.
///
/// Decompression failures are field-local: the field is left empty and the
/// rest of the record is still produced.
pub fn decode_record(buf: &[u8]) -> Result<TrafficRecord, DecodeError> {
    if buf.len() < layout::MIN_RECORD_LEN {
        return Err(DecodeError::Truncated {
            len: buf.len(),
            min: layout::MIN_RECORD_LEN,
        });
    }

    let path_len = buf[layout::PATH_LEN];
    let path_end = layout::PATH + path_len as usize + 1;

    let path = if path_len > 0 && path_end <= buf.len() {
        decompress_header(&buf[layout::PATH..path_end]).unwrap_or_else(|e| {
            warn!("Failed to decompress path header: {}", e);
            String::new()
        })
    } else {
        String::new()
    };

    let status = decompress_header(&buf[layout::STATUS..]).unwrap_or_else(|e| {
        warn!("Failed to decompress status header: {}", e);
        String::new()
    });

    Ok(TrafficRecord {
        phase: buf[layout::PHASE] as u32,
        destination_address: ipv4_at(buf, layout::DST_ADDR),
        destination_port: u16_be_at(buf, layout::DST_PORT),
        source_address: ipv4_at(buf, layout::SRC_ADDR),
        source_port: u16_be_at(buf, layout::SRC_PORT),
        sequence: u16_be_at(buf, layout::SEQ),
        duration_ticks: u32::from_be_bytes(array_at(buf, layout::DURATION)),
        process_id: u32::from_le_bytes(array_at(buf, layout::PID)),
        path_len,
        path,
        status,
    })
}

/// Decompress one NUL-padded HPACK header block into the value of its last
/// header field.
///
/// The padding is stripped first; an empty block yields an empty value.
pub fn decompress_header(raw: &[u8]) -> Result<String, DecodeError> {
    let block = trim_nul_padding(raw);

    let mut decoder = loona_hpack::Decoder::new();
    decoder.set_max_table_size(HEADER_TABLE_CAPACITY);

    let fields = decoder
        .decode(block)
        .map_err(|e| DecodeError::Header(format!("{:?}", e)))?;

    Ok(fields
        .last()
        .map(|(_, value)| String::from_utf8_lossy(value).into_owned())
        .unwrap_or_default())
}

/// Strip the trailing NUL bytes of a fixed-size kernel buffer
pub fn trim_nul_padding(raw: &[u8]) -> &[u8] {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &raw[..end]
}

// Callers have already checked `buf.len() >= MIN_RECORD_LEN`
fn array_at<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

fn ipv4_at(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::from(array_at::<4>(buf, offset))
}

fn u16_be_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(array_at(buf, offset))
}
