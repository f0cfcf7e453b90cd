//! Synchronization settings and the metadata filters compiled from them.

use std::collections::BTreeMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Node labels retained when no node label globs are configured.
pub const DEFAULT_NODE_LABELS: [&str; 3] = [
    "kubernetes.io/hostname",
    "topology.kubernetes.io/zone",
    "topology.kubernetes.io/region",
];

/// Settings that shape what the synchronization job watches and keeps.
///
/// Usually produced by an external config loader; every field may be omitted.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Value of the service proxy name label this instance is responsible for.
    /// Empty means "services without that label".
    pub service_proxy_name: String,

    /// Service labels to retain.
    pub service_label_globs: Vec<String>,

    /// Service annotations to retain.
    pub service_annotation_globs: Vec<String>,

    /// Node labels to retain.
    pub node_label_globs: Vec<String>,

    /// Node annotations to retain.
    pub node_annotation_globs: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            service_proxy_name: String::new(),
            service_label_globs: Vec::new(),
            service_annotation_globs: Vec::new(),
            node_label_globs: DEFAULT_NODE_LABELS.iter().map(ToString::to_string).collect(),
            node_annotation_globs: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the service proxy name this instance owns.
    #[must_use]
    pub fn service_proxy_name(mut self, name: impl Into<String>) -> Self {
        self.service_proxy_name = name.into();
        self
    }

    /// Sets the service label globs.
    #[must_use]
    pub fn service_labels<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_label_globs = globs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the service annotation globs.
    #[must_use]
    pub fn service_annotations<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_annotation_globs = globs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the node label globs, replacing the defaults.
    #[must_use]
    pub fn node_labels<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_label_globs = globs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the node annotation globs.
    #[must_use]
    pub fn node_annotations<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_annotation_globs = globs.into_iter().map(Into::into).collect();
        self
    }

    /// Compiles the service metadata globs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGlob`] if any glob does not parse.
    pub fn service_filter(&self) -> Result<MetadataFilter> {
        MetadataFilter::new(&self.service_label_globs, &self.service_annotation_globs)
    }

    /// Compiles the node metadata globs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGlob`] if any glob does not parse.
    pub fn node_filter(&self) -> Result<MetadataFilter> {
        MetadataFilter::new(&self.node_label_globs, &self.node_annotation_globs)
    }
}

/// Label and annotation name filter built from glob lists.
#[derive(Clone, Debug)]
pub struct MetadataFilter {
    labels: GlobSet,
    annotations: GlobSet,
}

impl MetadataFilter {
    /// Compiles label and annotation globs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGlob`] if any glob does not parse.
    pub fn new<S: AsRef<str>>(label_globs: &[S], annotation_globs: &[S]) -> Result<Self> {
        Ok(Self {
            labels: compile(label_globs)?,
            annotations: compile(annotation_globs)?,
        })
    }

    /// A filter that retains nothing.
    #[must_use]
    pub fn none() -> Self {
        Self {
            labels: GlobSet::empty(),
            annotations: GlobSet::empty(),
        }
    }

    /// Returns the labels whose names match a label glob.
    #[must_use]
    pub fn labels(&self, labels: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
        retain(&self.labels, labels)
    }

    /// Returns the annotations whose names match an annotation glob.
    #[must_use]
    pub fn annotations(
        &self,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String> {
        retain(&self.annotations, annotations)
    }
}

fn compile<S: AsRef<str>>(globs: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();

    for glob in globs {
        let glob = glob.as_ref();
        let compiled = Glob::new(glob).map_err(|source| Error::InvalidGlob {
            glob: glob.to_string(),
            source,
        })?;

        builder.add(compiled);
    }

    builder.build().map_err(|source| Error::InvalidGlob {
        glob: globs
            .iter()
            .map(AsRef::<str>::as_ref)
            .collect::<Vec<_>>()
            .join(","),
        source,
    })
}

fn retain(set: &GlobSet, values: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let Some(values) = values else {
        return BTreeMap::new();
    };

    if set.is_empty() {
        return BTreeMap::new();
    }

    values
        .iter()
        .filter(|(name, _)| set.is_match(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
