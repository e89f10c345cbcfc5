use url::form_urlencoded;

use crate::viewport::ViewMode;

/// Shareable location: which page, in which mode, with which search term.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerParams {
    pub index: Option<usize>,
    pub page: Option<String>,
    pub mode: Option<ViewMode>,
    pub search: Option<String>,
}

impl ViewerParams {
    /// Parses `page/<label>/mode/<mode>/search/<term>`. A bare number is the
    /// older index-only form. Unknown keys and bad modes are ignored.
    pub fn from_fragment(fragment: &str) -> Self {
        let fragment = fragment.trim_start_matches('#');
        let mut params = ViewerParams::default();
        if fragment.is_empty() {
            return params;
        }
        if fragment.bytes().all(|b| b.is_ascii_digit()) {
            params.index = fragment.parse().ok();
            return params;
        }

        let parts: Vec<&str> = fragment.split('/').collect();
        for pair in parts.chunks(2) {
            let [key, value] = pair else {
                continue;
            };
            match *key {
                "page" => params.page = Some(decode(value)),
                "mode" => params.mode = value.parse().ok(),
                "search" => params.search = Some(decode(value)),
                _ => {}
            }
        }
        params
    }

    pub fn to_fragment(&self) -> String {
        let mut segments = Vec::new();
        let page = match (&self.page, self.index) {
            (Some(label), _) => Some(label.clone()),
            (None, Some(index)) => Some(format!("n{index}")),
            (None, None) => None,
        };
        if let Some(page) = page {
            segments.push(format!("page/{}", encode(&page)));
        }
        if let Some(mode) = self.mode {
            segments.push(format!("mode/{mode}"));
        }
        if let Some(search) = self.search.as_deref().filter(|term| !term.is_empty()) {
            segments.push(format!("search/{}", encode(search)));
        }
        segments.join("/")
    }
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn decode(value: &str) -> String {
    form_urlencoded::parse(value.as_bytes())
        .map(|(key, rest)| {
            if rest.is_empty() {
                key.into_owned()
            } else {
                format!("{key}={rest}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_fragment_parses() {
        let params = ViewerParams::from_fragment("#page/xii/mode/2up/search/whale+song");
        assert_eq!(params.page.as_deref(), Some("xii"));
        assert_eq!(params.mode, Some(ViewMode::TwoPageSpread));
        assert_eq!(params.search.as_deref(), Some("whale song"));
        assert_eq!(params.index, None);
    }

    #[test]
    fn legacy_digits_mean_an_index() {
        let params = ViewerParams::from_fragment("42");
        assert_eq!(params.index, Some(42));
        assert!(params.page.is_none());
    }

    #[test]
    fn unknown_segments_and_modes_are_ignored() {
        let params = ViewerParams::from_fragment("theme/dark/mode/5up/page/n3/dangling");
        assert_eq!(params.mode, None);
        assert_eq!(params.page.as_deref(), Some("n3"));
    }

    #[test]
    fn fragment_escapes_labels_and_terms() {
        let params = ViewerParams {
            index: Some(7),
            page: None,
            mode: Some(ViewMode::ThumbnailGrid),
            search: Some("a/b c".into()),
        };
        let fragment = params.to_fragment();
        assert_eq!(fragment, "page/n7/mode/thumb/search/a%2Fb+c");
        let parsed = ViewerParams::from_fragment(&fragment);
        assert_eq!(parsed.search.as_deref(), Some("a/b c"));
        assert_eq!(parsed.page.as_deref(), Some("n7"));
    }
}
