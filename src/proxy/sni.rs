//! Best-effort TLS SNI extraction from a plaintext ClientHello.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

/// Pull the `server_name` out of a TLS ClientHello, if `data` starts with
/// one. Returns `None` on anything unexpected; relays never fail on this.
///
/// Only the first record of the first chunk is inspected. A ClientHello
/// split across TCP reads is not reassembled, so its SNI is lost.
#[must_use]
pub fn extract_sni(data: &[u8]) -> Option<String> {
    // Record header: Handshake content type, TLS 1.x major version.
    if data.len() < 5 || data[0] != 0x16 || data[1] != 0x03 {
        return None;
    }
    let record_len = usize::from(u16::from_be_bytes([data[3], data[4]]));
    let record = data.get(5..5 + record_len)?;
    // Handshake header: ClientHello, 3-byte length.
    if record.first() != Some(&0x01) {
        return None;
    }
    let mut pos = 4usize;
    // legacy_version + random
    pos += 2 + 32;
    // session_id
    let sid_len = usize::from(*record.get(pos)?);
    pos += 1 + sid_len;
    // cipher_suites
    let cs = record.get(pos..pos + 2)?;
    pos += 2 + usize::from(u16::from_be_bytes([cs[0], cs[1]]));
    // compression_methods
    let cm_len = usize::from(*record.get(pos)?);
    pos += 1 + cm_len;
    // extensions
    let ext = record.get(pos..pos + 2)?;
    let ext_total = usize::from(u16::from_be_bytes([ext[0], ext[1]]));
    pos += 2;
    let ext_end = usize::min(pos + ext_total, record.len());
    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([record[pos], record[pos + 1]]);
        let ext_len = usize::from(u16::from_be_bytes([record[pos + 2], record[pos + 3]]));
        pos += 4;
        if pos + ext_len > ext_end {
            return None;
        }
        if ext_type == 0x0000 {
            // server_name: a list length, then the first entry, which must
            // be of type host_name.
            let names = record.get(pos + 2..pos + ext_len)?;
            if names.first() != Some(&0x00) {
                return None;
            }
            let name_len = usize::from(u16::from_be_bytes([*names.get(1)?, *names.get(2)?]));
            let host = names.get(3..3 + name_len)?;
            return String::from_utf8(host.to_vec()).ok();
        }
        pos += ext_len;
    }
    None
}
