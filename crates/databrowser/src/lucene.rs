//! Lucene term assembly: negation syntax and special-character escaping.

/// The characters Lucene assigns meaning to; escaped before emission.
const ESCAPE: &[&str] = &[
    "+", "-", "&&", "||", "!", "(", ")", "{", "}", "[", "]", "^", "~", ":", "/",
];

pub fn escape(value: &str) -> String {
    let mut out = value.to_string();
    for token in ESCAPE {
        out = out.replace(token, &format!("\\{token}"));
    }
    out
}

/// Split facet values into positive and negative OR-joined term strings.
/// A leading `!` or `-`, a (case-insensitive) `not ` prefix, or a `_not_`
/// key suffix flips a term negative. Values of non-uniq keys are lowercased.
pub fn join_facet_queries(key: &str, values: &[String], uniq_keys: &[&str]) -> (String, String) {
    let mut positive = Vec::new();
    let mut negative = Vec::new();

    for value in values {
        let value = if uniq_keys.contains(&key) {
            value.clone()
        } else {
            value.to_lowercase()
        };
        if value.to_lowercase().starts_with("not ") {
            negative.push(value[4..].to_string());
        } else if value.starts_with('!') || value.starts_with('-') {
            negative.push(value[1..].to_string());
        } else if key.contains("_not_") {
            negative.push(value);
        } else {
            positive.push(value);
        }
    }

    (escape(&positive.join(" OR ")), escape(&negative.join(" OR ")))
}

#[cfg(test)]
mod test {
    use super::*;

    const UNIQ: &[&str] = &["file", "uri"];

    #[test]
    fn escapes_lucene_specials() {
        assert_eq!(escape("a/b:c"), "a\\/b\\:c");
        assert_eq!(escape("x~1"), "x\\~1");
    }

    #[test]
    fn negation_spellings() {
        let values = vec![
            "cmip".to_string(),
            "!era5".to_string(),
            "-obs".to_string(),
            "NOT reanalysis".to_string(),
        ];
        let (pos, neg) = join_facet_queries("project", &values, UNIQ);
        assert_eq!(pos, "cmip");
        assert_eq!(neg, "era5 OR obs OR reanalysis");
    }

    #[test]
    fn not_key_suffix_negates_everything() {
        let values = vec!["cmip".to_string(), "cordex".to_string()];
        let (pos, neg) = join_facet_queries("project_not_", &values, UNIQ);
        assert_eq!(pos, "");
        assert_eq!(neg, "cmip OR cordex");
    }

    #[test]
    fn uniq_keys_keep_case_and_get_escaped() {
        let values = vec!["/Arch/CMIP6/file.nc".to_string()];
        let (pos, _) = join_facet_queries("file", &values, UNIQ);
        assert_eq!(pos, "\\/Arch\\/CMIP6\\/file.nc");
    }

    #[test]
    fn other_values_are_lowercased() {
        let values = vec!["CMIP".to_string()];
        let (pos, _) = join_facet_queries("project", &values, UNIQ);
        assert_eq!(pos, "cmip");
    }
}
