use reqwest::Url;

/// Joins a provider base URL with an incoming request path, dropping the
/// longest run of segments where the tail of the base equals the head of the
/// request. Keeps `/v1/...` paths from being duplicated when the base URL
/// already ends with `/v1`. The raw query is attached verbatim.
pub fn join_url(base: &str, path: &str, raw_query: &str) -> Result<Url, String> {
    let mut url = Url::parse(base).map_err(|err| err.to_string())?;

    let base_segments = split_segments(url.path());
    let mut request_segments = split_segments(path);

    let max_overlap = base_segments.len().min(request_segments.len());
    for overlap in (1..=max_overlap).rev() {
        let tail = &base_segments[base_segments.len() - overlap..];
        if tail == &request_segments[..overlap] {
            request_segments.drain(..overlap);
            break;
        }
    }

    let mut merged = base_segments;
    merged.extend(request_segments);
    let joined = if merged.is_empty() {
        String::new()
    } else {
        format!("/{}", merged.join("/"))
    };

    url.set_path(&joined);
    url.set_query((!raw_query.is_empty()).then_some(raw_query));
    Ok(url)
}

fn split_segments(path: &str) -> Vec<String> {
    path.trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}
