use url::Url;

/// Last path component of a URL, falling back to the text after the last `/`
/// when the URL does not parse.
pub fn url_file_name(url_str: &str) -> String {
    match Url::parse(url_str) {
        Ok(url) => url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .unwrap_or_default()
            .to_string(),
        Err(_) => url_str.rsplit('/').next().unwrap_or(url_str).to_string(),
    }
}

/// Local file name for a URL, used when the caller gives no output path.
pub fn get_filename_from_url(url_str: &str) -> String {
    let name = sanitize_filename(&url_file_name(url_str));
    if name.is_empty() || name.chars().all(|c| c == '.' || c == '_') {
        "download".to_string()
    } else {
        name
    }
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Hex MD5 of a string.
pub fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}
