use regex::Regex;
use serde::{Deserialize, Serialize};

/// Oldest Windows 10/11 build with WSL2 support (20H1).
pub const MIN_WINDOWS_BUILD: u32 = 19041;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingSystem {
    Windows,
    Linux,
    Unknown,
}

/// Detect the current operating system
pub fn detect_os() -> OperatingSystem {
    #[cfg(target_os = "windows")]
    return OperatingSystem::Windows;

    #[cfg(target_os = "linux")]
    return OperatingSystem::Linux;

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    return OperatingSystem::Unknown;
}

/// Whether the host needs the WSL2 virtualization layer underneath the container runtime.
pub fn requires_virtualization_layer(os: OperatingSystem) -> bool {
    os == OperatingSystem::Windows
}

/// Parse the build number out of `cmd /c ver` output.
///
/// Expected format: "Microsoft Windows [Version 10.0.19045.3803]"
pub fn parse_windows_build(ver_output: &str) -> Option<u32> {
    let re = Regex::new(r"(?i)version\s+\d+\.\d+\.(\d+)").ok()?;
    re.captures(ver_output)?.get(1)?.as_str().parse().ok()
}

/// Whether a Windows build can host WSL2.
pub fn is_supported_windows_build(build: u32) -> bool {
    build >= MIN_WINDOWS_BUILD
}

/// Whether this Linux host boots with systemd (needed for the continuation unit).
pub fn has_systemd() -> bool {
    std::path::Path::new("/run/systemd/system").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_windows_build_standard_format() {
        let out = "\r\nMicrosoft Windows [Version 10.0.19045.3803]\r\n";
        assert_eq!(parse_windows_build(out), Some(19045));
    }

    #[test]
    fn parse_windows_build_windows_11() {
        assert_eq!(
            parse_windows_build("Microsoft Windows [Version 10.0.22631.2861]"),
            Some(22631)
        );
    }

    #[test]
    fn parse_windows_build_garbage_returns_none() {
        assert_eq!(parse_windows_build(""), None);
        assert_eq!(parse_windows_build("not a version"), None);
    }

    #[test]
    fn supported_build_threshold() {
        assert!(!is_supported_windows_build(18363));
        assert!(is_supported_windows_build(19041));
        assert!(is_supported_windows_build(22631));
    }

    #[test]
    fn only_windows_needs_virtualization_layer() {
        assert!(requires_virtualization_layer(OperatingSystem::Windows));
        assert!(!requires_virtualization_layer(OperatingSystem::Linux));
        assert!(!requires_virtualization_layer(OperatingSystem::Unknown));
    }
}
