//! Bot-challenge and CAPTCHA page detection.
//!
//! Anti-bot vendors often answer 200 with an interstitial instead of the
//! requested content. Such pages must be treated as blocks, not as empty
//! result pages, or the driver would declare the unit exhausted.

/// Only the head of a body is inspected; challenge markup sits near the top.
const SCAN_LIMIT: usize = 64 * 1024;

/// `(needle, label)` pairs, needles lowercase.
const CHALLENGE_MARKERS: &[(&str, &str)] = &[
    ("g-recaptcha", "recaptcha"),
    ("www.google.com/recaptcha", "recaptcha"),
    ("h-captcha", "hcaptcha"),
    ("hcaptcha.com", "hcaptcha"),
    ("cf-challenge", "cloudflare challenge"),
    ("challenge-platform", "cloudflare challenge"),
    ("cf-browser-verification", "cloudflare challenge"),
    ("<title>just a moment...</title>", "cloudflare interstitial"),
    ("_incapsula_resource", "incapsula"),
    ("px-captcha", "perimeterx"),
    ("captcha-delivery.com", "datadome"),
    ("our systems have detected unusual traffic", "unusual traffic"),
];

/// Return the label of the first challenge marker found in `body`.
pub fn detect_challenge(body: &str) -> Option<&'static str> {
    let mut end = body.len().min(SCAN_LIMIT);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let head = body[..end].to_ascii_lowercase();
    CHALLENGE_MARKERS
        .iter()
        .find(|(needle, _)| head.contains(needle))
        .map(|(_, label)| *label)
}

/// Status codes treated as rate limiting or blocking.
pub fn is_block_status(status: u16) -> bool {
    matches!(status, 403 | 429)
}
