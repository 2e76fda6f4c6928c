use encoding_rs::GBK;

/// Decodes raw remote output. Windows hosts with a Chinese code page answer in
/// GBK, so that is tried when the bytes are not valid UTF-8.
pub fn decode_output(bytes: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }

    let (cow, _encoding_used, had_errors) = GBK.decode(bytes);
    if !had_errors {
        return cow.into_owned();
    }

    // Last resort so a garbled line never aborts a pass.
    String::from_utf8_lossy(bytes).to_string()
}
