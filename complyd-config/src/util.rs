use std::collections::HashMap;

/// Returns the variable only when it is set to something other than whitespace.
pub fn non_blank<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name)
        .map(String::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Parses a numeric override, ignoring values that do not parse.
pub fn parse_var<T: std::str::FromStr>(vars: &HashMap<String, String>, name: &str) -> Option<T> {
    let raw = non_blank(vars, name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = raw, "ignoring unparsable override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn blank_values_count_as_unset() {
        let vars = vars(&[("A", "  "), ("B", " x ")]);
        assert_eq!(non_blank(&vars, "A"), None);
        assert_eq!(non_blank(&vars, "B"), Some("x"));
        assert_eq!(non_blank(&vars, "C"), None);
    }

    #[test]
    fn bad_numbers_are_ignored() {
        let vars = vars(&[("N", "12"), ("M", "twelve")]);
        assert_eq!(parse_var::<usize>(&vars, "N"), Some(12));
        assert_eq!(parse_var::<usize>(&vars, "M"), None);
    }
}
