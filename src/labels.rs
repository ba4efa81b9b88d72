use crate::config::{LabelsConfig, Validatable};
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("Failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("Labels file is empty")]
    Empty,
}

/// Class names indexed by the class id the detector emits.
#[derive(Debug, Clone, Default)]
pub struct ClassLabels {
    names: Vec<String>,
}

impl ClassLabels {
    pub fn new(labels_cfg: &LabelsConfig) -> Result<Self, LabelsError> {
        let names = load_labels(&labels_cfg.get_path())?;
        tracing::info!("Loaded {} class labels", names.len());
        Ok(Self { names })
    }

    #[cfg(test)]
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self, class_id: usize) -> String {
        match self.names.get(class_id) {
            Some(name) => name.clone(),
            None => format!("Unknown class {}", class_id),
        }
    }
}

/// One class name per line, blank lines ignored.
pub fn load_labels(filepath: &Path) -> Result<Vec<String>, LabelsError> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut names = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let name = line.trim();
        if name.is_empty() {
            continue;
        }
        names.push(name.to_string());
    }

    if names.is_empty() {
        return Err(LabelsError::Empty);
    }

    Ok(names)
}
