//! Image selection predicates.

/// Base directory of public frameworks.
pub const FRAMEWORKS_DIR: &str = "/System/Library/Frameworks/";
/// Base directory of private frameworks.
pub const PRIVATE_FRAMEWORKS_DIR: &str = "/System/Library/PrivateFrameworks/";

/// Selects an image in the cache by install path.
#[derive(Debug, Clone, Copy)]
pub enum ImageMatcher<'a> {
    /// Exact install-path equality.
    Exact(&'a str),
    /// `<name>.framework` under the public frameworks directory.
    Framework(&'a str),
    /// `<name>.framework` under the private frameworks directory.
    PrivateFramework(&'a str),
}

impl ImageMatcher<'_> {
    /// Returns true if the install path selects this image.
    pub fn matches(&self, path: &str) -> bool {
        match *self {
            Self::Exact(expected) => path == expected,
            Self::Framework(name) => framework_matches(FRAMEWORKS_DIR, name, path),
            Self::PrivateFramework(name) => framework_matches(PRIVATE_FRAMEWORKS_DIR, name, path),
        }
    }

    /// A human-readable name for diagnostics.
    pub fn name(&self) -> String {
        match *self {
            Self::Exact(path) => path.to_string(),
            Self::Framework(name) | Self::PrivateFramework(name) => format!("{name}.framework"),
        }
    }
}

/// Matches `<base_dir><name>.framework/<name>` and the
/// `Versions/A` layout used by macOS-style bundles.
fn framework_matches(base_dir: &str, name: &str, path: &str) -> bool {
    let Some(rest) = path.strip_prefix(base_dir) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix(name) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix(".framework/") else {
        return false;
    };
    rest == name || rest.strip_prefix("Versions/A/") == Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let matcher = ImageMatcher::Exact("/usr/lib/libobjc.A.dylib");
        assert!(matcher.matches("/usr/lib/libobjc.A.dylib"));
        assert!(!matcher.matches("/usr/lib/libobjc.A.dylib2"));
        assert!(!matcher.matches("/usr/lib/libobjc.B.dylib"));
    }

    #[test]
    fn public_framework_match() {
        let matcher = ImageMatcher::Framework("QuartzCore");
        assert!(matcher.matches("/System/Library/Frameworks/QuartzCore.framework/QuartzCore"));
        assert!(matcher
            .matches("/System/Library/Frameworks/QuartzCore.framework/Versions/A/QuartzCore"));
        assert!(!matcher.matches(
            "/System/Library/PrivateFrameworks/QuartzCore.framework/QuartzCore"
        ));
        assert!(!matcher.matches("/System/Library/Frameworks/QuartzCoreX.framework/QuartzCore"));
        assert!(!matcher.matches("/System/Library/Frameworks/QuartzCore.framework/Helper"));
    }

    #[test]
    fn private_framework_match() {
        let matcher = ImageMatcher::PrivateFramework("NeutrinoCore");
        assert!(matcher
            .matches("/System/Library/PrivateFrameworks/NeutrinoCore.framework/NeutrinoCore"));
        assert!(!matcher.matches("/System/Library/Frameworks/NeutrinoCore.framework/NeutrinoCore"));
    }

    #[test]
    fn matcher_names() {
        assert_eq!(ImageMatcher::Exact("/usr/lib/x.dylib").name(), "/usr/lib/x.dylib");
        assert_eq!(ImageMatcher::Framework("CoreImage").name(), "CoreImage.framework");
        assert_eq!(
            ImageMatcher::PrivateFramework("CMCapture").name(),
            "CMCapture.framework"
        );
    }
}
