//! Best-effort application-layer peeks. All functions here must never
//! panic on malformed input — a parse failure just means an empty result,
//! per §4.2's policy that peek failures are not errors.

use std::net::IpAddr;

/// Parse DNS answer records out of a UDP/53 payload, returning
/// `(answer_ip, query_name, ttl_secs)` triples. Handles simple name
/// compression (a single pointer jump) in both the question and answer
/// sections; anything stranger is skipped rather than mis-parsed.
pub fn parse_dns_answers(payload: &[u8]) -> Vec<(IpAddr, String, u32)> {
    let mut out = Vec::new();
    if payload.len() < 12 {
        return out;
    }
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let ancount = u16::from_be_bytes([payload[6], payload[7]]) as usize;
    if ancount == 0 {
        return out;
    }

    let mut pos = 12usize;

    // Skip the question section; remember the first question's name as the
    // query name to associate with any answers that compress back to it.
    let mut query_name = String::new();
    for i in 0..qdcount {
        let (name, next) = match read_name(payload, pos) {
            Some(v) => v,
            None => return out,
        };
        if i == 0 {
            query_name = name;
        }
        if next + 4 > payload.len() {
            return out;
        }
        pos = next + 4; // skip QTYPE + QCLASS
    }

    for _ in 0..ancount {
        let (name, next) = match read_name(payload, pos) {
            Some(v) => v,
            None => break,
        };
        if next + 10 > payload.len() {
            break;
        }
        let rtype = u16::from_be_bytes([payload[next], payload[next + 1]]);
        let ttl = u32::from_be_bytes([
            payload[next + 4],
            payload[next + 5],
            payload[next + 6],
            payload[next + 7],
        ]);
        let rdlength = u16::from_be_bytes([payload[next + 8], payload[next + 9]]) as usize;
        let rdata_start = next + 10;
        if rdata_start + rdlength > payload.len() {
            break;
        }
        let rdata = &payload[rdata_start..rdata_start + rdlength];

        let resolved_name = if name.is_empty() { query_name.clone() } else { name };

        match rtype {
            1 if rdlength == 4 => {
                // A record.
                let ip = IpAddr::from([rdata[0], rdata[1], rdata[2], rdata[3]]);
                out.push((ip, resolved_name, ttl));
            }
            28 if rdlength == 16 => {
                // AAAA record.
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                out.push((IpAddr::from(octets), resolved_name, ttl));
            }
            _ => {}
        }

        pos = rdata_start + rdlength;
    }

    out
}

/// Read a (possibly compressed) DNS name at `pos`, returning the decoded
/// name and the offset just past it in the *original* buffer (a single
/// pointer jump does not advance the caller's cursor past the jump).
fn read_name(buf: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    let start = pos;
    let mut jumped = false;
    let mut end_after_first_jump = 0usize;
    let mut guard = 0;

    loop {
        guard += 1;
        if guard > 128 || pos >= buf.len() {
            return None;
        }
        let len = buf[pos] as usize;
        if len == 0 {
            pos += 1;
            if !jumped {
                end_after_first_jump = pos;
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            if pos + 1 >= buf.len() {
                return None;
            }
            let offset = (((len & 0x3F) as usize) << 8) | buf[pos + 1] as usize;
            if !jumped {
                end_after_first_jump = pos + 2;
            }
            jumped = true;
            pos = offset;
            continue;
        }
        if pos + 1 + len > buf.len() {
            return None;
        }
        labels.push(String::from_utf8_lossy(&buf[pos + 1..pos + 1 + len]).into_owned());
        pos += 1 + len;
    }

    let name = labels.join(".");
    let next = if jumped { end_after_first_jump } else { pos };
    debug_assert!(next >= start || jumped);
    Some((name, next))
}

/// Scan the first TLS record for a ClientHello and extract its SNI
/// extension, if present. Rejects host names containing non-DNS characters.
pub fn parse_tls_sni(payload: &[u8]) -> Option<String> {
    // TLS record header: type(1) version(2) length(2).
    if payload.len() < 5 || payload[0] != 0x16 {
        return None; // not a handshake record
    }
    let record_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    let record_end = (5 + record_len).min(payload.len());
    let body = &payload[5..record_end];

    // Handshake header: msg_type(1) length(3).
    if body.len() < 4 || body[0] != 0x01 {
        return None; // not a ClientHello
    }

    // ClientHello: version(2) random(32) session_id_len(1) session_id
    //   cipher_suites_len(2) cipher_suites compression_len(1) compression
    //   extensions_len(2) extensions...
    let mut p = 4 + 2 + 32;
    if p >= body.len() {
        return None;
    }
    let session_id_len = body[p] as usize;
    p += 1 + session_id_len;
    if p + 2 > body.len() {
        return None;
    }
    let cipher_len = u16::from_be_bytes([body[p], body[p + 1]]) as usize;
    p += 2 + cipher_len;
    if p >= body.len() {
        return None;
    }
    let comp_len = body[p] as usize;
    p += 1 + comp_len;
    if p + 2 > body.len() {
        return None;
    }
    let ext_total_len = u16::from_be_bytes([body[p], body[p + 1]]) as usize;
    p += 2;
    let ext_end = (p + ext_total_len).min(body.len());

    while p + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([body[p], body[p + 1]]);
        let ext_len = u16::from_be_bytes([body[p + 2], body[p + 3]]) as usize;
        let ext_start = p + 4;
        if ext_start + ext_len > body.len() {
            break;
        }
        if ext_type == 0x0000 {
            // server_name extension: list_len(2) then entries of
            // type(1) name_len(2) name.
            let ext_body = &body[ext_start..ext_start + ext_len];
            if ext_body.len() >= 5 && ext_body[2] == 0x00 {
                let name_len = u16::from_be_bytes([ext_body[3], ext_body[4]]) as usize;
                if 5 + name_len <= ext_body.len() {
                    let raw = &ext_body[5..5 + name_len];
                    if let Ok(s) = std::str::from_utf8(raw) {
                        if is_valid_hostname(s) {
                            return Some(s.to_string());
                        }
                    }
                }
            }
            return None;
        }
        p = ext_start + ext_len;
    }
    None
}

fn is_valid_hostname(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// Scan a plaintext HTTP request's first line for `(Host, Method)`.
pub fn parse_http_request_line(payload: &[u8]) -> (Option<String>, Option<String>) {
    let text = match std::str::from_utf8(payload) {
        Ok(t) => t,
        Err(_) => return (None, None),
    };

    let mut method = None;
    if let Some(first_line) = text.lines().next() {
        let mut parts = first_line.split_whitespace();
        if let Some(m) = parts.next() {
            if matches!(m, "GET" | "POST" | "PUT" | "DELETE" | "HEAD" | "OPTIONS" | "PATCH") {
                method = Some(m.to_string());
            }
        }
    }

    let mut host = None;
    for line in text.lines().skip(1) {
        if let Some(rest) = line.to_ascii_lowercase().strip_prefix("host:") {
            host = Some(rest.trim().to_string());
            break;
        }
        if line.is_empty() {
            break; // end of headers
        }
    }

    (host, method)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_dns_a_answer(name: &str, ip: [u8; 4], ttl: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf[6] = 0x00;
        buf[7] = 0x01; // QDCOUNT = 1
        buf[4] = 0x00;
        buf[5] = 0x01; // ANCOUNT = 1 (reused header layout below fixes order)
        // Correct header layout: ID(2) FLAGS(2) QDCOUNT(2) ANCOUNT(2) NSCOUNT(2) ARCOUNT(2)
        buf = vec![0u8; 12];
        buf[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        buf[6..8].copy_from_slice(&1u16.to_be_bytes()); // ANCOUNT

        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0); // root
        buf.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
        buf.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN

        // Answer: pointer to name at offset 12, TYPE A, CLASS IN, TTL, RDLENGTH, RDATA
        buf.extend_from_slice(&[0xC0, 0x0C]);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&ttl.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&ip);
        buf
    }

    #[test]
    fn parses_a_record_answer() {
        let payload = build_dns_a_answer("example.com", [93, 184, 216, 34], 300);
        let answers = parse_dns_answers(&payload);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].0, IpAddr::from([93, 184, 216, 34]));
        assert_eq!(answers[0].1, "example.com");
        assert_eq!(answers[0].2, 300);
    }

    #[test]
    fn empty_payload_yields_no_answers() {
        assert!(parse_dns_answers(&[]).is_empty());
    }

    #[test]
    fn rejects_non_handshake_tls_record() {
        let payload = [0x17, 0x03, 0x03, 0x00, 0x05, 1, 2, 3, 4, 5];
        assert_eq!(parse_tls_sni(&payload), None);
    }

    #[test]
    fn parses_http_host_and_method() {
        let req = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\n\r\n";
        let (host, method) = parse_http_request_line(req);
        assert_eq!(host.as_deref(), Some("example.com"));
        assert_eq!(method.as_deref(), Some("GET"));
    }

    #[test]
    fn rejects_hostname_with_invalid_characters() {
        assert!(!is_valid_hostname("evil<script>"));
        assert!(is_valid_hostname("example.com"));
    }
}
