//! Build failure diagnosis.
//!
//! Matches compiler and build-system stderr against known signatures.
//! Anything unrecognized returns `None` and is shown to the user verbatim.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// What went wrong in a failed build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    MissingHeader { header: String },
    MissingLibrary { library: String },
    OutOfMemory,
    CmakePackageNotFound { package: String },
    MissingCompiler { compiler: String },
    PermissionDenied,
}

/// A recognized build failure with a suggested fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDiagnosis {
    pub cause: FailureCause,
    pub suggestion: String,
    /// 0.0 to 1.0.
    pub confidence: f32,
    /// Packages that would likely fix the failure (Debian name, then RPM name).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
}

static MISSING_HEADER: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"fatal error: ([\w./+-]+\.h): No such file or directory").unwrap(),
        Regex::new(r"fatal error: '([\w./+-]+\.h)' file not found").unwrap(),
    ]
});

static MISSING_LIBRARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cannot find -l([\w+.-]+)").unwrap());

static OUT_OF_MEMORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(virtual memory exhausted|out of memory|cannot allocate memory|killed signal terminated program|fatal error: killed|signal 9 \(kill\))",
    )
    .unwrap()
});

static CMAKE_PACKAGE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r#"Could not find a package configuration file provided by "([\w.+-]+)""#)
            .unwrap(),
        Regex::new(r"Could NOT find ([\w.+-]+)").unwrap(),
    ]
});

static MISSING_COMPILER: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"No CMAKE_(C|CXX)_COMPILER could be found").unwrap(),
        Regex::new(r"(?m)(?:^|\s)(gcc|g\+\+|cc|c\+\+|clang|clang\+\+|make): (?:command )?not found")
            .unwrap(),
        Regex::new(r"linker `(\w+)` not found").unwrap(),
    ]
});

static PERMISSION_DENIED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)permission denied|operation not permitted").unwrap());

/// Known header locations, mapped to (Debian, RPM) development packages.
const HEADER_PACKAGES: &[(&str, &str, &str)] = &[
    ("openssl/", "libssl-dev", "openssl-devel"),
    ("zlib.h", "zlib1g-dev", "zlib-devel"),
    ("ffi.h", "libffi-dev", "libffi-devel"),
    ("bzlib.h", "libbz2-dev", "bzip2-devel"),
    ("readline/", "libreadline-dev", "readline-devel"),
    ("sqlite3.h", "libsqlite3-dev", "sqlite-devel"),
    ("curl/", "libcurl4-openssl-dev", "libcurl-devel"),
    ("ncurses.h", "libncurses-dev", "ncurses-devel"),
    ("curses.h", "libncurses-dev", "ncurses-devel"),
    ("Python.h", "python3-dev", "python3-devel"),
    ("yaml.h", "libyaml-dev", "libyaml-devel"),
    ("X11/", "libx11-dev", "libX11-devel"),
    ("lzma.h", "liblzma-dev", "xz-devel"),
    ("pcre2.h", "libpcre2-dev", "pcre2-devel"),
];

/// Diagnose a failed build from its stderr.
pub fn analyze_build_failure(stderr: &str) -> Option<BuildDiagnosis> {
    if OUT_OF_MEMORY.is_match(stderr) {
        return Some(BuildDiagnosis {
            cause: FailureCause::OutOfMemory,
            suggestion: "The compiler ran out of memory. Retry with lower parallelism, e.g. \
                         MAKEFLAGS=-j1 or `cargo build -j 1`."
                .to_string(),
            confidence: 0.85,
            packages: Vec::new(),
        });
    }

    if let Some(header) = first_capture(&MISSING_HEADER, stderr) {
        return Some(diagnose_header(&header));
    }

    if let Some(caps) = MISSING_LIBRARY.captures(stderr) {
        let library = caps[1].to_string();
        let (deb, rpm) = dev_packages(&library);
        return Some(BuildDiagnosis {
            suggestion: format!(
                "The linker cannot find lib{library}. Install {deb} (Debian/Ubuntu) or {rpm} (Fedora/RHEL)."
            ),
            cause: FailureCause::MissingLibrary { library },
            confidence: 0.8,
            packages: vec![deb, rpm],
        });
    }

    if let Some(package) = first_capture(&CMAKE_PACKAGE, stderr) {
        let (deb, rpm) = dev_packages(&package.to_lowercase());
        return Some(BuildDiagnosis {
            suggestion: format!(
                "CMake could not find {package}. Install its development package \
                 (likely {deb} or {rpm}) or set {package}_DIR."
            ),
            cause: FailureCause::CmakePackageNotFound { package },
            confidence: 0.7,
            packages: vec![deb, rpm],
        });
    }

    if let Some(compiler) = first_capture(&MISSING_COMPILER, stderr) {
        let compiler = match compiler.as_str() {
            "C" => "cc".to_string(),
            "CXX" => "c++".to_string(),
            _ => compiler,
        };
        return Some(BuildDiagnosis {
            suggestion: format!(
                "No working {compiler} was found. Install build-essential (Debian/Ubuntu) \
                 or the \"Development Tools\" group (Fedora/RHEL)."
            ),
            cause: FailureCause::MissingCompiler { compiler },
            confidence: 0.9,
            packages: vec!["build-essential".to_string(), "gcc".to_string()],
        });
    }

    if PERMISSION_DENIED.is_match(stderr) {
        return Some(BuildDiagnosis {
            cause: FailureCause::PermissionDenied,
            suggestion: "The build wrote to a location it does not own. Install into a \
                         user-owned prefix or rerun the step with sudo."
                .to_string(),
            confidence: 0.6,
            packages: Vec::new(),
        });
    }

    None
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(text))
        .map(|caps| caps[1].to_string())
}

fn diagnose_header(header: &str) -> BuildDiagnosis {
    let known = HEADER_PACKAGES
        .iter()
        .find(|(prefix, _, _)| header.starts_with(prefix));

    let (deb, rpm, confidence) = match known {
        Some((_, deb, rpm)) => ((*deb).to_string(), (*rpm).to_string(), 0.9),
        None => {
            let stem = header
                .split('/')
                .next()
                .unwrap_or(header)
                .trim_end_matches(".h");
            let (deb, rpm) = dev_packages(stem);
            (deb, rpm, 0.6)
        }
    };

    BuildDiagnosis {
        suggestion: format!(
            "Header {header} is missing. Install {deb} (Debian/Ubuntu) or {rpm} (Fedora/RHEL)."
        ),
        cause: FailureCause::MissingHeader {
            header: header.to_string(),
        },
        confidence,
        packages: vec![deb, rpm],
    }
}

/// Guess (Debian, RPM) development package names for a library.
fn dev_packages(name: &str) -> (String, String) {
    match name {
        "ssl" | "crypto" | "openssl" => ("libssl-dev".into(), "openssl-devel".into()),
        "z" | "zlib" => ("zlib1g-dev".into(), "zlib-devel".into()),
        _ => {
            let base = name.strip_prefix("lib").unwrap_or(name);
            (format!("lib{base}-dev"), format!("{base}-devel"))
        }
    }
}
