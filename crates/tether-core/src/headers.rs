//! Header folding for tunneled HTTP calls.
//!
//! `http_proxy_request` and `http_proxy_response` carry one string per header
//! name, so repeated headers are folded into that string. `set-cookie` values
//! may contain commas and are separated by a newline instead, which can never
//! appear inside a header value.

use std::collections::BTreeMap;

const SET_COOKIE: &str = "set-cookie";

fn separator(name: &str) -> &'static str {
    if name.eq_ignore_ascii_case(SET_COOKIE) {
        "\n"
    } else if name.eq_ignore_ascii_case("cookie") {
        "; "
    } else {
        ", "
    }
}

/// Add one header value under its lowercase name, folding it into any value
/// already present.
pub fn append_header(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    headers
        .entry(name.to_ascii_lowercase())
        .and_modify(|folded| {
            folded.push_str(separator(name));
            folded.push_str(value);
        })
        .or_insert_with(|| value.to_string());
}

/// The individual values to emit for a folded header.
pub fn header_values<'a>(name: &str, folded: &'a str) -> Vec<&'a str> {
    if name.eq_ignore_ascii_case(SET_COOKIE) {
        folded.split('\n').filter(|v| !v.is_empty()).collect()
    } else {
        vec![folded]
    }
}
