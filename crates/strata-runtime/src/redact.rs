const REDACTED: &str = "[REDACTED]";
const SENSITIVE_KEYS: &[&str] = &["password", "passwd", "secret", "token", "key"];

/// Scrubs secret values from text before it is logged or shown.
///
/// Two rules apply: every known secret value is replaced wherever it occurs,
/// and the value of any `name=value` or `name: value` assignment whose name
/// looks sensitive is replaced.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        let mut secrets: Vec<String> = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        // Longest first, so a secret that contains another is replaced whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_owned();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        let mut result = String::with_capacity(out.len());
        for line in out.split_inclusive('\n') {
            result.push_str(&redact_assignments(line));
        }
        result
    }
}

fn is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|k| lower.contains(k))
}

fn redact_assignments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut redact_next = false;
    for word in line.split_inclusive([' ', '\t']) {
        let token = word.trim_end_matches([' ', '\t', '\n', '\r']);
        let trailer = &word[token.len()..];

        if token.is_empty() {
            out.push_str(word);
            continue;
        }
        if redact_next {
            out.push_str(REDACTED);
            out.push_str(trailer);
            redact_next = false;
            continue;
        }
        match sensitive_split(token) {
            Some(pos) => {
                out.push_str(&token[..=pos]);
                if pos + 1 == token.len() {
                    redact_next = true;
                } else {
                    out.push_str(REDACTED);
                }
                out.push_str(trailer);
            }
            None => out.push_str(word),
        }
    }
    out
}

/// Byte offset of the first `=`/`:` whose preceding segment names something
/// sensitive, e.g. the second `=` in `Environment=DB_PASSWORD=x`.
fn sensitive_split(token: &str) -> Option<usize> {
    let mut segment_start = 0;
    for (pos, c) in token.char_indices() {
        if c != '=' && c != ':' {
            continue;
        }
        if is_sensitive(&token[segment_start..pos]) && !token[pos..].starts_with("://") {
            return Some(pos);
        }
        segment_start = pos + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_secret_values_are_replaced() {
        let r = Redactor::new(vec!["hunter2".to_owned(), String::new()]);
        assert_eq!(
            r.redact("psql -c \"ALTER USER app PASSWORD 'hunter2'\""),
            "psql -c \"ALTER USER app PASSWORD '[REDACTED]'\""
        );
    }

    #[test]
    fn sensitive_assignments_are_replaced() {
        let r = Redactor::default();
        assert_eq!(
            r.redact("Environment=DB_PASSWORD=s3cr3t\nExecStart=/usr/bin/app\n"),
            "Environment=DB_PASSWORD=[REDACTED]\nExecStart=/usr/bin/app\n"
        );
        assert_eq!(r.redact("api_token: abc123 other"), "api_token: [REDACTED] other");
        assert_eq!(r.redact("MEILI_MASTER_KEY=xyz"), "MEILI_MASTER_KEY=[REDACTED]");
    }

    #[test]
    fn ordinary_text_is_untouched() {
        let r = Redactor::new(vec!["zzz".to_owned()]);
        let text = "listen 443 ssl;\nserver_name example.org;\n";
        assert_eq!(r.redact(text), text);
        assert_eq!(
            r.redact("keyring_url=https://example.org"),
            "keyring_url=[REDACTED]"
        );
        assert_eq!(r.redact("key://not-an-assignment"), "key://not-an-assignment");
    }

    #[test]
    fn overlapping_secrets_redact_longest_first() {
        let r = Redactor::new(vec!["abc".to_owned(), "abcdef".to_owned()]);
        assert_eq!(r.redact("x abcdef y"), "x [REDACTED] y");
    }
}
