//! Small utility helpers used across modules.

/// Derive the WebSocket endpoint from the HTTP API base:
/// `http://` → `ws://`, `https://` → `wss://`, trailing slash dropped, "/ws" appended.
pub fn derive_ws_url(api_url: &str) -> String {
  let base = api_url.trim().trim_end_matches('/');
  let lower = base.to_ascii_lowercase();
  let swapped = if lower.starts_with("https://") {
    format!("wss://{}", &base["https://".len()..])
  } else if lower.starts_with("http://") {
    format!("ws://{}", &base["http://".len()..])
  } else {
    base.to_string()
  };
  format!("{}/ws", swapped)
}

/// Keep only ASCII digits and cut at 11, mirroring the login input mask.
pub fn normalize_cpf(raw: &str) -> String {
  raw.chars().filter(|c| c.is_ascii_digit()).take(11).collect()
}

/// CPF safe for logs: last two digits only.
pub fn mask_cpf(cpf: &str) -> String {
  let n = cpf.chars().count();
  if n <= 2 {
    return "*".repeat(n);
  }
  let tail: String = cpf.chars().skip(n - 2).collect();
  format!("{}{}", "*".repeat(n - 2), tail)
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.chars().count() <= max {
    s.to_string()
  } else {
    let head: String = s.chars().take(max).collect();
    format!("{}… ({} bytes total)", head, s.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ws_url_follows_scheme() {
    assert_eq!(derive_ws_url("http://localhost:8000"), "ws://localhost:8000/ws");
    assert_eq!(derive_ws_url("HTTPS://api.example.com/"), "wss://api.example.com/ws");
  }

  #[test]
  fn cpf_mask_and_normalize() {
    assert_eq!(normalize_cpf("123.456.789-0912"), "12345678909");
    assert_eq!(mask_cpf("12345678909"), "*********09");
    assert_eq!(trunc_for_log("abcdef", 3), "abc… (6 bytes total)");
  }
}
