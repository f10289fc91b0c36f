/// Header list for upstream requests. Order is preserved and lookups are
/// case-insensitive, matching how the wire treats header names.
pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, existing)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *existing = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36";

/// Baseline headers for every upstream chat call: bearer auth plus the
/// browser-ish fields the web client always sends.
pub fn chat_headers(token: &str, cookie: &str, request_id: &str) -> Headers {
    let mut headers = Vec::new();
    header_set(&mut headers, "Authorization", format!("Bearer {token}"));
    header_set(&mut headers, "Content-Type", "application/json");
    header_set(&mut headers, "User-Agent", BROWSER_USER_AGENT);
    header_set(&mut headers, "source", "web");
    header_set(&mut headers, "x-request-id", request_id);
    header_set(&mut headers, "accept", "*/*");
    header_set(&mut headers, "x-accel-buffering", "no");
    if !cookie.is_empty() {
        header_set(&mut headers, "Cookie", cookie);
    }
    headers
}

/// Extra fingerprint headers sent when the vision fallback model is in
/// play; the fallback path is pickier about looking like a real browser tab.
pub fn add_browser_fingerprint(headers: &mut Headers, base_url: &str) {
    header_set(
        headers,
        "sec-ch-ua",
        "\"Chromium\";v=\"139\", \"Not;A=Brand\";v=\"99\"",
    );
    header_set(headers, "sec-ch-ua-mobile", "?0");
    header_set(headers, "sec-ch-ua-platform", "\"Windows\"");
    header_set(headers, "sec-fetch-dest", "empty");
    header_set(headers, "sec-fetch-mode", "cors");
    header_set(headers, "sec-fetch-site", "same-origin");
    header_set(headers, "Referer", format!("{base_url}/"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_headers_carry_auth_and_identifiers() {
        let headers = chat_headers("tok", "session=abc", "req-1");
        assert_eq!(header_get(&headers, "authorization"), Some("Bearer tok"));
        assert_eq!(header_get(&headers, "source"), Some("web"));
        assert_eq!(header_get(&headers, "x-request-id"), Some("req-1"));
        assert_eq!(header_get(&headers, "x-accel-buffering"), Some("no"));
        assert_eq!(header_get(&headers, "cookie"), Some("session=abc"));
    }

    #[test]
    fn empty_cookie_is_omitted() {
        let headers = chat_headers("tok", "", "req-1");
        assert!(header_get(&headers, "cookie").is_none());
    }

    #[test]
    fn fingerprint_adds_sec_families_and_referer() {
        let mut headers = chat_headers("tok", "", "req-1");
        add_browser_fingerprint(&mut headers, "https://chat.qwen.ai");
        assert!(header_get(&headers, "sec-ch-ua").is_some());
        assert_eq!(header_get(&headers, "sec-fetch-mode"), Some("cors"));
        assert_eq!(header_get(&headers, "referer"), Some("https://chat.qwen.ai/"));
    }

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers = vec![("Accept".to_string(), "text/html".to_string())];
        header_set(&mut headers, "accept", "*/*");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "ACCEPT"), Some("*/*"));
    }
}
