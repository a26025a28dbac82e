//! Password file lookup.
//!
//! Each non-comment line is `host:port:dbname:user:password`. A field of `*`
//! matches anything; `\` escapes `:` and `\` inside a field.

use std::fs;
use std::path::Path;

fn split_fields(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    if let Some(last) = fields.last_mut() {
                        last.push(escaped);
                    }
                }
            }
            // the password itself may contain unescaped colons
            ':' if fields.len() < 5 => fields.push(String::new()),
            c => {
                if let Some(last) = fields.last_mut() {
                    last.push(c);
                }
            }
        }
    }
    fields
}

fn field_matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern == value
}

#[cfg(unix)]
fn is_private(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match fs::metadata(path) {
        Ok(meta) => {
            if meta.permissions().mode() & 0o077 != 0 {
                log::warn!(
                    "password file \"{}\" has group or world access; permissions should be u=rw (0600) or less",
                    path.display()
                );
                false
            } else {
                true
            }
        }
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_private(_path: &Path) -> bool {
    true
}

/// Find the password for the given target, if the file names one.
pub(super) fn lookup(
    path: &Path,
    host: &str,
    port: &str,
    dbname: &str,
    user: &str,
) -> Option<String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::trace!("password file \"{}\" not read: {}", path.display(), e);
            return None;
        }
    };
    if !is_private(path) {
        return None;
    }

    content
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(split_fields)
        .filter(|fields| fields.len() == 5)
        .find(|f| {
            field_matches(&f[0], host)
                && field_matches(&f[1], port)
                && field_matches(&f[2], dbname)
                && field_matches(&f[3], user)
        })
        .map(|mut f| f.swap_remove(4))
}
