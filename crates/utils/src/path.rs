use std::ffi::OsStr;
use std::fmt::Display;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Quote an argument so a default POSIX shell would parse it back
/// unchanged. Plain paths are returned as-is.
pub(crate) fn shell_quote(arg: &OsStr) -> String {
    if let Some(s) = arg.to_str() {
        if !s.is_empty()
            && s
                .chars()
                .all(|c| matches!(c, '/' | '.' | '-' | '_' | '=' | ',') || c.is_alphanumeric())
        {
            return s.to_owned();
        }
    }
    match shlex::bytes::try_quote(arg.as_bytes()) {
        Ok(r) => String::from_utf8_lossy(&r).into_owned(),
        // Only possible with a nul byte, which can't be in an argv anyway
        Err(_) => String::from_utf8_lossy(arg.as_bytes()).into_owned(),
    }
}

/// Display a path in log messages, shell-quoted when it contains
/// whitespace or metacharacters.
#[derive(Debug)]
pub struct QuotedPath<'a> {
    path: &'a Path,
}

impl Display for QuotedPath<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&shell_quote(self.path.as_os_str()))
    }
}

impl<'a> QuotedPath<'a> {
    /// Wrap a path for display.
    pub fn new<P: AsRef<Path> + ?Sized>(path: &'a P) -> QuotedPath<'a> {
        QuotedPath {
            path: path.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unquoted() {
        for v in ["foo", "/dev/sda", "/dev/disk/by-label/config-2", "/dev/nvme0n1p4"] {
            assert_eq!(v, QuotedPath::new(v).to_string());
        }
    }

    #[test]
    fn test_quoted() {
        let cases = [
            ("", "''"),
            (" ", "' '"),
            ("/tmp/config drive", "'/tmp/config drive'"),
            ("/foo/!/bar&", "'/foo/!/bar&'"),
        ];
        for (v, quoted) in cases {
            assert_eq!(quoted, QuotedPath::new(v).to_string());
        }
    }

    #[test]
    fn test_nonutf8() {
        let p = Path::new(OsStr::from_bytes(b"/tmp/cd\xEE"));
        assert!(p.to_str().is_none());
        let q = QuotedPath::new(p).to_string();
        assert!(q.starts_with("'/tmp/cd"), "{q}");
    }
}
