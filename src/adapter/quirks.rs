//! Known firmware defects and the workarounds for them.
//!
//! Each quirk is a named, pure function so it can be exercised with canned
//! input. None of them are general network resilience; they encode facts
//! about specific firmware builds.

use crate::family::GatewayFamily;

/// N720 endpoint whose JSON body loses its first bytes
pub const TRUNCATED_REPORT_RESOURCE: &str = "report_group.json";

/// The head every `report_group.json` body starts with
pub const REPORT_GROUP_HEAD: &str = r#"{"group""#;

/// Endpoints that close the TCP connection after processing the command but
/// before the HTTP response is complete
const N720_RESET_TOLERANT: &[&str] = &["update_nv.cgi", "reboot.cgi"];
const N510_RESET_TOLERANT: &[&str] = &["reboot.cgi", "save.cgi"];

/// Whether a connection reset from `resource` means the write was applied
pub fn is_reset_tolerant(family: GatewayFamily, resource: &str) -> bool {
    let resource = resource.trim_start_matches('/');
    let resource = resource.split('?').next().unwrap_or(resource);
    let tolerant = match family {
        GatewayFamily::N510 => N510_RESET_TOLERANT,
        GatewayFamily::N720 => N720_RESET_TOLERANT,
        GatewayFamily::Unknown => return false,
    };
    tolerant.iter().any(|endpoint| *endpoint == resource)
}

/// Whether `resource` is served with its head cut off
pub fn has_truncation_bug(resource: &str) -> bool {
    resource.trim_start_matches('/') == TRUNCATED_REPORT_RESOURCE
}

/// Rebuild a JSON body whose first bytes were dropped by the firmware.
///
/// A body already starting with `{` is returned unchanged. Otherwise the
/// longest suffix of `head` that is also a prefix of the body is taken as
/// the surviving part of the head, and the rest of `head` is prepended.
/// Brackets still open at the end are then closed, because the same bug
/// also shifts the tail out of the buffer on some builds.
pub fn repair_truncated(body: &str, head: &str) -> String {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        return body.to_string();
    }

    let overlap = (1..=head.len())
        .rev()
        .filter(|&n| head.is_char_boundary(head.len() - n))
        .find(|&n| trimmed.starts_with(&head[head.len() - n..]))
        .unwrap_or(0);
    let missing = &head[..head.len() - overlap];

    log::debug!(
        "repairing truncated body: prepending {:?} ({} byte overlap)",
        missing,
        overlap
    );

    let mut repaired = String::with_capacity(missing.len() + trimmed.len() + 2);
    repaired.push_str(missing);
    repaired.push_str(trimmed);
    close_open_brackets(&mut repaired);
    repaired
}

/// Append the closers for any `{`/`[` left open, ignoring string contents
fn close_open_brackets(json: &mut String) {
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in json.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
    }

    while let Some(closer) = open.pop() {
        json.push(closer);
    }
}

/// Convert every line ending to CRLF, as the N720 CSV loader requires
pub fn normalize_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 16);
    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches('\n').trim_end_matches('\r');
        out.push_str(content);
        if line.ends_with('\n') {
            out.push_str("\r\n");
        }
    }
    out
}
