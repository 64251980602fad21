//! Sandbox detection and command-vector rewriting.

/// Environment marker set by Flatpak inside an application sandbox.
pub const FLATPAK_SANDBOX_VAR: &str = "FLATPAK_SANDBOX_DIR";

/// Launcher tokens that escape a Flatpak sandbox onto the host.
pub const FLATPAK_ESCAPE: [&str; 3] = ["flatpak-spawn", "--host", "--watch-bus"];

/// Where spawned commands run relative to a restricted sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sandbox {
    /// Commands run as given.
    #[default]
    Direct,
    /// Commands are forwarded to the host through `flatpak-spawn`.
    Flatpak,
}

impl Sandbox {
    /// Detect the sandbox from the current process environment.
    pub fn detect() -> Self {
        Self::detect_with(|name| std::env::var_os(name).map(|v| v.to_string_lossy().into_owned()))
    }

    /// Detect the sandbox through an arbitrary variable lookup.
    pub fn detect_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup(FLATPAK_SANDBOX_VAR).is_some() {
            Sandbox::Flatpak
        } else {
            Sandbox::Direct
        }
    }

    /// Rewrite `argv` so it runs outside the sandbox.
    pub fn rewrite(self, argv: Vec<String>) -> Vec<String> {
        match self {
            Sandbox::Direct => argv,
            Sandbox::Flatpak => {
                let mut out = Vec::with_capacity(argv.len() + FLATPAK_ESCAPE.len());
                out.extend(FLATPAK_ESCAPE.iter().map(|s| s.to_string()));
                out.extend(argv);
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn detects_flatpak_marker() {
        let flatpak = Sandbox::detect_with(|name| {
            (name == FLATPAK_SANDBOX_VAR).then(|| "/run/flatpak/sandbox".to_string())
        });
        assert_eq!(flatpak, Sandbox::Flatpak);
        assert_eq!(Sandbox::detect_with(|_| None), Sandbox::Direct);
    }

    #[test]
    fn direct_leaves_command_alone() {
        let argv = vec!["make".to_string(), "-j4".to_string()];
        assert_eq!(Sandbox::Direct.rewrite(argv.clone()), argv);
    }

    proptest! {
        #[test]
        fn flatpak_prefixes_exactly_three_tokens(argv in prop::collection::vec("[^\\x00]{0,12}", 1..8)) {
            let out = Sandbox::Flatpak.rewrite(argv.clone());
            prop_assert_eq!(out.len(), argv.len() + 3);
            prop_assert_eq!(&out[..3], &FLATPAK_ESCAPE.map(String::from)[..]);
            prop_assert_eq!(&out[3..], &argv[..]);
        }
    }
}
