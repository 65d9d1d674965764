use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tag::TaggingStrategy;

/// One published image entry. The image name is the surrounding map key;
/// `dockerRepo`/`dockerTag`/`dockerImageID` are this struct's fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEntry {
    #[serde(rename = "dockerRepo")]
    pub repo: String,
    #[serde(rename = "dockerTag")]
    pub tag: String,
    #[serde(rename = "dockerImageID")]
    pub image_id: String,
    pub tag_strategy: TaggingStrategy,
}

/// Mapping from image name to its publish entry. Created empty, appended to
/// by the publish phase, serialized at termination as a single-line JSON
/// document with a mandatory trailing newline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublishReport(BTreeMap<String, PublishEntry>);

impl PublishReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, image_name: impl Into<String>, entry: PublishEntry) {
        self.0.insert(image_name.into(), entry);
    }

    pub fn get(&self, image_name: &str) -> Option<&PublishEntry> {
        self.0.get(image_name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PublishEntry)> {
        self.0.iter()
    }

    /// Render as a single-line JSON document with a mandatory trailing
    /// newline.
    pub fn to_report_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_starts_empty() {
        let report = PublishReport::new();
        assert!(report.is_empty());
    }

    #[test]
    fn to_report_line_has_trailing_newline() {
        let mut report = PublishReport::new();
        report.record(
            "web",
            PublishEntry {
                repo: "registry.example.com/web".into(),
                tag: "latest".into(),
                image_id: "sha256:abc".into(),
                tag_strategy: TaggingStrategy::Custom,
            },
        );
        let line = report.to_report_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn record_overwrites_same_image_name() {
        let mut report = PublishReport::new();
        let entry = |tag: &str| PublishEntry {
            repo: "r".into(),
            tag: tag.into(),
            image_id: "sha256:x".into(),
            tag_strategy: TaggingStrategy::StagesSignature,
        };
        report.record("web", entry("v1"));
        report.record("web", entry("v2"));
        assert_eq!(report.len(), 1);
        assert_eq!(report.get("web").unwrap().tag, "v2");
    }
}
