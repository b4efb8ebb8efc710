//! Platform classifier (`<os>-<arch>`) used to pick the matching
//! distribution artifact.

pub const DEFAULT_MAPPING: &str = "i386->x86";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchMapping {
    pub from: String,
    pub to: String,
}

impl ArchMapping {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let pair: Vec<&str> = value.split("->").collect();
        if pair.len() != 2 || pair.iter().any(|part| part.is_empty()) {
            anyhow::bail!("invalid mapping \"{value}\" (should be \"from->to\")");
        }
        Ok(Self {
            from: pair[0].to_string(),
            to: pair[1].to_string(),
        })
    }
}

/// Builds the classifier from an OS name and architecture.
///
/// Only the first word of the OS name is kept; the architecture goes through
/// every mapping in order.
pub fn classify(os_name: &str, arch: &str, mappings: &[ArchMapping]) -> String {
    let mut arch = arch.to_lowercase();
    for mapping in mappings {
        if arch == mapping.from {
            tracing::info!(
                "architecture \"{}\" changed to \"{}\"",
                mapping.from,
                mapping.to
            );
            arch = mapping.to.clone();
        }
    }
    let os = os_name
        .split(' ')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    format!("{os}-{arch}")
}

/// Classifier of the running host.
pub fn host_classifier(mappings: &[ArchMapping]) -> String {
    classify(host_os_name(), std::env::consts::ARCH, mappings)
}

fn host_os_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "Mac OS X",
        "windows" => "Windows",
        "linux" => "Linux",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_first_word_of_os_name() {
        assert_eq!(classify("Mac OS X", "x86_64", &[]), "mac-x86_64");
        assert_eq!(classify("Windows 10", "amd64", &[]), "windows-amd64");
    }

    #[test]
    fn applies_mappings_in_order() {
        let mappings = vec![
            ArchMapping::parse(DEFAULT_MAPPING).unwrap(),
            ArchMapping::parse("x86->ia32").unwrap(),
        ];
        assert_eq!(classify("Linux", "i386", &mappings), "linux-ia32");
        assert_eq!(classify("Linux", "AMD64", &mappings), "linux-amd64");
    }

    #[test]
    fn rejects_malformed_mapping() {
        let err = ArchMapping::parse("i386=>x86").unwrap_err();
        assert!(err.to_string().contains("from->to"));
        assert!(ArchMapping::parse("a->b->c").is_err());
        assert!(ArchMapping::parse("i386->").is_err());
        assert!(ArchMapping::parse("->x86").is_err());
    }

    #[test]
    fn host_classifier_has_two_parts() {
        let value = host_classifier(&[]);
        assert!(value.contains('-'));
        assert!(!value.starts_with('-'));
    }
}
