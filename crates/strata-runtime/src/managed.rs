use crate::RuntimeError;

/// A block of configuration owned by Strata inside a larger file, delimited by
/// unique begin/end sentinel lines carrying the block's marker.
///
/// Applying a block removes every previous copy of it before appending the new
/// one, so re-applying converges instead of accumulating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedBlock {
    pub marker: String,
    pub body: String,
}

impl ManagedBlock {
    pub fn new(marker: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            body: body.into(),
        }
    }

    pub fn begin_line(&self) -> String {
        begin_line(&self.marker)
    }

    pub fn end_line(&self) -> String {
        end_line(&self.marker)
    }

    /// The block as written to disk, newline-terminated.
    pub fn render(&self) -> String {
        let body = self.body.trim_end_matches('\n');
        if body.is_empty() {
            format!("{}\n{}\n", self.begin_line(), self.end_line())
        } else {
            format!("{}\n{body}\n{}\n", self.begin_line(), self.end_line())
        }
    }

    /// Rewrite `content` so it holds exactly one, current copy of this block.
    pub fn apply(&self, content: &str, path: &str) -> Result<String, RuntimeError> {
        let stripped = strip(content, &self.marker, path)?;
        let kept = stripped.trim_end_matches('\n');
        if kept.is_empty() {
            Ok(self.render())
        } else {
            Ok(format!("{kept}\n{}", self.render()))
        }
    }
}

fn begin_line(marker: &str) -> String {
    format!("# BEGIN {marker} (managed by strata)")
}

fn end_line(marker: &str) -> String {
    format!("# END {marker} (managed by strata)")
}

/// Remove every block with `marker` from `content`.
///
/// An unterminated block or a stray end sentinel is an error: the file was
/// edited by hand and guessing the block's extent could delete operator content.
pub fn strip(content: &str, marker: &str, path: &str) -> Result<String, RuntimeError> {
    let begin = begin_line(marker);
    let end = end_line(marker);
    let corrupt = || RuntimeError::CorruptManagedBlock {
        path: path.to_owned(),
        marker: marker.to_owned(),
    };

    let mut out = String::with_capacity(content.len());
    let mut inside = false;
    for line in content.lines() {
        let trimmed = line.trim_end();
        if trimmed == begin {
            if inside {
                return Err(corrupt());
            }
            inside = true;
        } else if trimmed == end {
            if !inside {
                return Err(corrupt());
            }
            inside = false;
        } else if !inside {
            out.push_str(line);
            out.push('\n');
        }
    }
    if inside {
        return Err(corrupt());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PG_HBA: &str = "local all postgres peer\nhost all all 127.0.0.1/32 scram-sha-256\n";

    #[test]
    fn apply_appends_delimited_block() {
        let block = ManagedBlock::new("strata-acl", "host all app 10.0.0.0/16 scram-sha-256");
        let out = block.apply(PG_HBA, "/etc/pg_hba.conf").unwrap();
        assert!(out.starts_with(PG_HBA));
        assert!(out.ends_with(
            "# BEGIN strata-acl (managed by strata)\nhost all app 10.0.0.0/16 scram-sha-256\n# END strata-acl (managed by strata)\n"
        ));
    }

    #[test]
    fn reapply_is_byte_identical() {
        let block = ManagedBlock::new("strata-acl", "host all app 10.0.0.0/16 scram-sha-256\n");
        let once = block.apply(PG_HBA, "f").unwrap();
        let twice = block.apply(&once, "f").unwrap();
        let thrice = block.apply(&twice, "f").unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice, thrice);
        assert_eq!(once.matches("# BEGIN strata-acl").count(), 1);
    }

    #[test]
    fn changed_body_replaces_old_block() {
        let old = ManagedBlock::new("acl", "user alice");
        let new = ManagedBlock::new("acl", "user bob");
        let out = new.apply(&old.apply(PG_HBA, "f").unwrap(), "f").unwrap();
        assert!(!out.contains("alice"));
        assert!(out.contains("user bob"));
        assert_eq!(out.matches("# BEGIN acl").count(), 1);
    }

    #[test]
    fn duplicate_blocks_collapse_to_one() {
        let block = ManagedBlock::new("acl", "user bob");
        let doubled = format!("{}{}", block.render(), block.render());
        let out = block.apply(&doubled, "f").unwrap();
        assert_eq!(out, block.render());
    }

    #[test]
    fn other_markers_are_untouched() {
        let ours = ManagedBlock::new("acl", "x");
        let theirs = ManagedBlock::new("tuning", "y");
        let base = theirs.apply(PG_HBA, "f").unwrap();
        let out = ours.apply(&base, "f").unwrap();
        assert!(out.contains(&theirs.render()));
        assert!(out.contains(&ours.render()));
    }

    #[test]
    fn missing_trailing_newline_and_empty_file() {
        let block = ManagedBlock::new("acl", "x");
        assert_eq!(block.apply("", "f").unwrap(), block.render());
        assert_eq!(
            block.apply("a", "f").unwrap(),
            format!("a\n{}", block.render())
        );
    }

    #[test]
    fn unterminated_block_is_corrupt() {
        let block = ManagedBlock::new("acl", "x");
        let broken = format!("{PG_HBA}{}\nuser eve\n", block.begin_line());
        assert!(matches!(
            block.apply(&broken, "/etc/pg_hba.conf"),
            Err(RuntimeError::CorruptManagedBlock { .. })
        ));
        let stray_end = format!("{PG_HBA}{}\n", block.end_line());
        assert!(block.apply(&stray_end, "f").is_err());
    }
}
