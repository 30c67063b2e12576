use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, UnetError},
    vol::Vol,
};

/// One training example: an image and its one-hot label map of the same
/// spatial size.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: Vol,
    pub label: Vol,
}

impl Sample {
    pub fn new(image: Vol, label: Vol) -> Self {
        Self { image, label }
    }

    /// Checks channel and class counts and that image and label line up.
    pub fn validate(&self, index: usize, channels: usize, n_class: usize) -> Result<()> {
        if self.image.depth() != channels {
            return Err(UnetError::data(
                index,
                format!("image has {} channels, expected {channels}", self.image.depth()),
            ));
        }
        if self.label.depth() != n_class {
            return Err(UnetError::data(
                index,
                format!("label has {} classes, expected {n_class}", self.label.depth()),
            ));
        }
        if self.image.sx() != self.label.sx() || self.image.sy() != self.label.sy() {
            return Err(UnetError::data(
                index,
                format!(
                    "image is {} but label is {}",
                    self.image.shape(),
                    self.label.shape()
                ),
            ));
        }
        Ok(())
    }
}

/// Indexed access to samples. Indices run from 1 to `len()` inclusive.
pub trait SampleSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(&self, index: usize) -> Result<Sample>;
}

fn check_index(index: usize, len: usize) -> Result<()> {
    if index == 0 || index > len {
        return Err(UnetError::data(
            index,
            format!("index out of range, valid indices are 1..={len}"),
        ));
    }
    Ok(())
}

pub struct MemorySource {
    samples: Vec<Sample>,
}

impl MemorySource {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl SampleSource for MemorySource {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn load(&self, index: usize) -> Result<Sample> {
        check_index(index, self.samples.len())?;
        Ok(self.samples[index - 1].clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    #[default]
    Json,
    Bincode,
}

impl SampleFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Bincode => "bin",
        }
    }
}

pub fn read_vol(path: &Path, format: SampleFormat) -> Result<Vol> {
    let reader = BufReader::new(File::open(path)?);
    let vol = match format {
        SampleFormat::Json => serde_json::from_reader(reader)?,
        SampleFormat::Bincode => bincode::deserialize_from(reader)?,
    };
    Ok(vol)
}

pub fn write_vol(path: &Path, vol: &Vol, format: SampleFormat) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    match format {
        SampleFormat::Json => serde_json::to_writer(writer, vol)?,
        SampleFormat::Bincode => bincode::serialize_into(writer, vol)?,
    }
    Ok(())
}

/// Samples stored as `<dir>/<stem>_<index>.<ext>`, one file for the image
/// and one for the label.
#[derive(Debug, Clone)]
pub struct FileSource {
    dir: PathBuf,
    image_stem: String,
    label_stem: String,
    count: usize,
    format: SampleFormat,
}

impl FileSource {
    pub fn new(
        dir: impl Into<PathBuf>,
        image_stem: impl Into<String>,
        label_stem: impl Into<String>,
        count: usize,
        format: SampleFormat,
    ) -> Self {
        Self {
            dir: dir.into(),
            image_stem: image_stem.into(),
            label_stem: label_stem.into(),
            count,
            format,
        }
    }

    pub fn image_path(&self, index: usize) -> PathBuf {
        self.path(&self.image_stem, index)
    }

    pub fn label_path(&self, index: usize) -> PathBuf {
        self.path(&self.label_stem, index)
    }

    fn path(&self, stem: &str, index: usize) -> PathBuf {
        self.dir
            .join(format!("{stem}_{index}.{}", self.format.extension()))
    }

    fn read(&self, path: &Path, index: usize) -> Result<Vol> {
        read_vol(path, self.format)
            .map_err(|err| UnetError::data(index, format!("{}: {err}", path.display())))
    }
}

impl SampleSource for FileSource {
    fn len(&self) -> usize {
        self.count
    }

    fn load(&self, index: usize) -> Result<Sample> {
        check_index(index, self.count)?;
        let image = self.read(&self.image_path(index), index)?;
        let label = self.read(&self.label_path(index), index)?;
        Ok(Sample::new(image, label))
    }
}
