//! Atlas label conventions and named label sets.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const DEFAULT_RIGHT_OFFSET: i32 = 20000;

/// An ordered set of atlas label ids with a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionLabelSet {
    pub name: String,
    labels: Vec<i32>,
}

impl RegionLabelSet {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Vec::new(),
        }
    }

    pub fn new(name: impl Into<String>, labels: &[i32]) -> Result<Self> {
        let mut set = Self::empty(name);
        for &label in labels {
            if !set.insert(label) {
                return Err(PipelineError::Config(format!(
                    "label {label} listed twice in region `{}`",
                    set.name
                )));
            }
        }
        Ok(set)
    }

    /// Append `label`; returns `false` if it was already present.
    pub fn insert(&mut self, label: i32) -> bool {
        if self.labels.contains(&label) {
            return false;
        }
        self.labels.push(label);
        true
    }

    pub fn contains(&self, label: i32) -> bool {
        self.labels.contains(&label)
    }

    pub fn labels(&self) -> &[i32] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn is_disjoint(&self, other: &RegionLabelSet) -> bool {
        !self.labels.iter().any(|l| other.contains(*l))
    }
}

impl fmt::Display for RegionLabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.name, self.labels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hemisphere {
    Left,
    Right,
}

impl Hemisphere {
    pub fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

impl fmt::Display for Hemisphere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => f.write_str("left"),
            Self::Right => f.write_str("right"),
        }
    }
}

/// A bilateral structure and its label in each hemisphere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub name: String,
    pub left: i32,
    pub right: i32,
}

impl Structure {
    pub fn label(&self, side: Hemisphere) -> i32 {
        match side {
            Hemisphere::Left => self.left,
            Hemisphere::Right => self.right,
        }
    }
}

/// How hemispheres are encoded in the atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HemisphereLayout {
    /// Distinct left and right ids.
    Lateralized,
    /// One id per structure; the right copy is derived as `label + right_offset`.
    Bilateral {
        #[serde(default = "default_right_offset")]
        right_offset: i32,
    },
}

fn default_right_offset() -> i32 {
    DEFAULT_RIGHT_OFFSET
}

/// Which atlas labels make up the striatum and the fallback reference region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtlasConvention {
    pub name: String,
    pub structures: Vec<Structure>,
    pub fallback_reference: Vec<i32>,
    pub layout: HemisphereLayout,
}

impl AtlasConvention {
    /// Desikan-Killiany labels with distinct left/right ids.
    pub fn dka() -> Self {
        Self {
            name: "dka".into(),
            structures: vec![
                Structure { name: "caudate".into(), left: 11, right: 50 },
                Structure { name: "putamen".into(), left: 12, right: 51 },
            ],
            fallback_reference: vec![8, 47],
            layout: HemisphereLayout::Lateralized,
        }
    }

    /// Desikan-Killiany with hemispheres merged under the left ids.
    pub fn dka_merged() -> Self {
        Self {
            name: "dka-merged".into(),
            structures: vec![
                Structure { name: "caudate".into(), left: 11, right: 11 },
                Structure { name: "putamen".into(), left: 12, right: 12 },
            ],
            fallback_reference: vec![8],
            layout: HemisphereLayout::Bilateral {
                right_offset: DEFAULT_RIGHT_OFFSET,
            },
        }
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "dka" => Ok(Self::dka()),
            "dka-merged" => Ok(Self::dka_merged()),
            other => Err(PipelineError::Config(format!(
                "unknown atlas convention `{other}` (expected dka or dka-merged)"
            ))),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PipelineError::Config(format!("cannot open atlas convention {}: {e}", path.display()))
        })?;
        let convention: Self = serde_json::from_reader(BufReader::new(file))?;
        convention.validate()?;
        Ok(convention)
    }

    pub fn validate(&self) -> Result<()> {
        if self.structures.is_empty() {
            return Err(PipelineError::Config(format!(
                "atlas convention `{}` lists no striatal structures",
                self.name
            )));
        }
        if let HemisphereLayout::Bilateral { right_offset } = self.layout {
            if right_offset <= 0 {
                return Err(PipelineError::Config(format!(
                    "right offset of `{}` must be positive",
                    self.name
                )));
            }
        }
        let lateral = self.lateralized();
        let striatal = lateral.striatal_labels();
        let unique = RegionLabelSet::new("striatum", &striatal).map_err(|_| {
            PipelineError::Config(format!(
                "atlas convention `{}` reuses a striatal label across structures or hemispheres",
                self.name
            ))
        })?;
        if lateral.fallback_reference.iter().any(|l| unique.contains(*l)) {
            return Err(PipelineError::Config(format!(
                "fallback reference of `{}` overlaps the striatum",
                self.name
            )));
        }
        Ok(())
    }

    /// The same convention with distinct right-hemisphere ids.
    pub fn lateralized(&self) -> Self {
        match self.layout {
            HemisphereLayout::Lateralized => self.clone(),
            HemisphereLayout::Bilateral { right_offset } => {
                let structures = self
                    .structures
                    .iter()
                    .map(|s| Structure {
                        name: s.name.clone(),
                        left: s.left,
                        right: s.left + right_offset,
                    })
                    .collect();
                let mut fallback_reference = self.fallback_reference.clone();
                fallback_reference.extend(self.fallback_reference.iter().map(|l| l + right_offset));
                Self {
                    name: self.name.clone(),
                    structures,
                    fallback_reference,
                    layout: HemisphereLayout::Lateralized,
                }
            }
        }
    }

    /// Labels that get a right-hemisphere copy when mirroring a bilateral atlas.
    pub fn mirrored_labels(&self) -> Vec<i32> {
        let mut labels: Vec<i32> = self.structures.iter().map(|s| s.left).collect();
        labels.extend(&self.fallback_reference);
        labels.sort_unstable();
        labels.dedup();
        labels
    }

    pub fn striatal_labels(&self) -> Vec<i32> {
        self.structures
            .iter()
            .flat_map(|s| [s.left, s.right])
            .collect()
    }

    pub fn all_labels(&self) -> Vec<i32> {
        let mut labels = self.striatal_labels();
        labels.extend(&self.fallback_reference);
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_sets_reject_duplicates_and_keep_order() {
        let set = RegionLabelSet::new("striatum", &[51, 50]).unwrap();
        assert_eq!(set.labels(), [51, 50]);
        assert!(RegionLabelSet::new("striatum", &[11, 11]).is_err());

        let mut reference = RegionLabelSet::empty("reference");
        assert!(reference.insert(11));
        assert!(!reference.insert(11));
        assert!(set.is_disjoint(&reference));
    }

    #[test]
    fn merged_convention_lateralizes_with_offset() {
        let merged = AtlasConvention::dka_merged();
        let lateral = merged.lateralized();
        assert_eq!(lateral.layout, HemisphereLayout::Lateralized);
        assert_eq!(lateral.structures[0].right, 20011);
        assert_eq!(lateral.fallback_reference, [8, 20008]);
        assert_eq!(merged.mirrored_labels(), [8, 11, 12]);
        assert!(merged.validate().is_ok());
        assert!(AtlasConvention::dka().validate().is_ok());
    }

    #[test]
    fn custom_convention_parses_from_json() {
        let json = r#"{
            "name": "custom",
            "structures": [{"name": "striatum", "left": 3, "right": 3}],
            "fallback_reference": [9],
            "layout": {"kind": "bilateral"}
        }"#;
        let convention: AtlasConvention = serde_json::from_str(json).unwrap();
        assert_eq!(
            convention.layout,
            HemisphereLayout::Bilateral { right_offset: DEFAULT_RIGHT_OFFSET }
        );
        assert!(convention.validate().is_ok());

        let clash = AtlasConvention {
            layout: HemisphereLayout::Lateralized,
            ..convention
        };
        assert!(clash.validate().is_err());
    }

    #[test]
    fn unknown_preset_is_a_config_error() {
        assert!(matches!(AtlasConvention::preset("aal"), Err(PipelineError::Config(_))));
    }
}
