use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use machine_learning::{
    arch::{Model, ResNet, ResNetConfig},
    optimization::{Adam, AdamScalars},
};
use ndarray::Array1;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{Result, TransferErr, metrics_log::MetricsLog};

const FORMAT: &str = "bn-transfer/1";

/// A complete post-epoch training state.
pub struct Checkpoint {
    pub model: ResNet,
    pub params: Vec<f32>,
    pub optimizer: Adam,
    pub epoch: usize,
    pub acc: f32,
    pub logs: MetricsLog,
    /// The regularization target of every normalization layer.
    pub references: Vec<Array1<f32>>,
}

impl Checkpoint {
    pub fn view(&self) -> CheckpointRef<'_> {
        CheckpointRef {
            model: &self.model,
            params: &self.params,
            optimizer: &self.optimizer,
            epoch: self.epoch,
            acc: self.acc,
            logs: &self.logs,
            references: &self.references,
        }
    }
}

/// A borrowed `Checkpoint`, what gets written to disk.
#[derive(Clone, Copy)]
pub struct CheckpointRef<'a> {
    pub model: &'a ResNet,
    pub params: &'a [f32],
    pub optimizer: &'a Adam,
    pub epoch: usize,
    pub acc: f32,
    pub logs: &'a MetricsLog,
    pub references: &'a [Array1<f32>],
}

/// Reads and writes checkpoints as a single safetensors file.
///
/// Tensors: `params`, `bn.<i>.running_mean`, `bn.<i>.running_var`, `reference.<i>`,
/// `optimizer.v` and `optimizer.s`. Everything else goes in the string metadata.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Writes the whole state to a sibling temporary file, syncs it and renames it over the
    /// checkpoint, so the checkpoint on disk is always either the previous or the new state.
    pub fn save(&self, state: CheckpointRef<'_>) -> Result<()> {
        let bytes = encode(state)?;

        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let tmp = self.tmp_path()?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        log::debug!(
            "saved checkpoint {} ({} bytes, epoch {})",
            self.path.display(),
            bytes.len(),
            state.epoch
        );
        Ok(())
    }

    /// Reads the checkpoint back, `None` if there is no file.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        decode(&bytes).map(Some)
    }

    fn tmp_path(&self) -> Result<PathBuf> {
        let mut name = self
            .path
            .file_name()
            .ok_or_else(|| {
                TransferErr::InvalidConfig(format!(
                    "checkpoint path {} doesn't name a file",
                    self.path.display()
                ))
            })?
            .to_os_string();

        name.push(".tmp");
        Ok(self.path.with_file_name(name))
    }
}

fn encode(state: CheckpointRef<'_>) -> Result<Vec<u8>> {
    let CheckpointRef {
        model,
        params,
        optimizer,
        epoch,
        acc,
        logs,
        references,
    } = state;

    let (v, s) = optimizer.moments();
    let mut owned: Vec<(String, Vec<f32>)> = Vec::new();
    for (i, bn) in model.norm_layers().into_iter().enumerate() {
        owned.push((format!("bn.{i}.running_mean"), bn.running_mean().to_vec()));
        owned.push((format!("bn.{i}.running_var"), bn.running_var().to_vec()));
    }
    for (i, reference) in references.iter().enumerate() {
        owned.push((format!("reference.{i}"), reference.to_vec()));
    }

    let mut tensors = vec![
        ("params".to_string(), tensor_view(params)?),
        ("optimizer.v".to_string(), tensor_view(v)?),
        ("optimizer.s".to_string(), tensor_view(s)?),
    ];
    for (name, values) in &owned {
        tensors.push((name.clone(), tensor_view(values)?));
    }

    let metadata = HashMap::from([
        ("format".to_string(), FORMAT.to_string()),
        ("architecture".to_string(), serde_json::to_string(&model.config())?),
        ("epoch".to_string(), epoch.to_string()),
        ("acc".to_string(), acc.to_string()),
        ("optimizer".to_string(), serde_json::to_string(&optimizer.scalars())?),
        ("logs".to_string(), serde_json::to_string(logs)?),
    ]);

    Ok(safetensors::serialize(tensors, &Some(metadata))?)
}

fn tensor_view(values: &[f32]) -> Result<TensorView<'_>> {
    Ok(TensorView::new(
        Dtype::F32,
        vec![values.len()],
        bytemuck::cast_slice(values),
    )?)
}

fn decode(bytes: &[u8]) -> Result<Checkpoint> {
    let (_, metadata) = SafeTensors::read_metadata(bytes)?;
    let info = metadata
        .metadata()
        .as_ref()
        .ok_or_else(|| invalid("missing metadata".into()))?;
    let field = |key: &str| {
        info.get(key)
            .map(String::as_str)
            .ok_or_else(|| invalid(format!("missing `{key}` metadata")))
    };

    let format = field("format")?;
    if format != FORMAT {
        return Err(invalid(format!("unsupported format `{format}`")));
    }

    let config: ResNetConfig = serde_json::from_str(field("architecture")?)?;
    let epoch: usize = field("epoch")?
        .parse()
        .map_err(|e| invalid(format!("bad epoch: {e}")))?;
    let acc: f32 = field("acc")?
        .parse()
        .map_err(|e| invalid(format!("bad accuracy: {e}")))?;
    let scalars: AdamScalars = serde_json::from_str(field("optimizer")?)?;
    let logs: MetricsLog = serde_json::from_str(field("logs")?)?;

    let tensors = SafeTensors::deserialize(bytes)?;
    let read = |name: &str| -> Result<Vec<f32>> {
        let view = tensors.tensor(name)?;
        if view.dtype() != Dtype::F32 {
            return Err(invalid(format!("tensor `{name}` is not f32")));
        }

        Ok(view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    };

    let mut model = ResNet::new(config);
    let params = read("params")?;
    if params.len() != model.size() {
        return Err(invalid(format!(
            "{} parameters for a {} with {}",
            params.len(),
            config.architecture,
            model.size()
        )));
    }

    let mut references = Vec::new();
    for (i, bn) in model.norm_layers_mut().into_iter().enumerate() {
        let mean = read(&format!("bn.{i}.running_mean"))?;
        let var = read(&format!("bn.{i}.running_var"))?;
        bn.set_running_stats(Array1::from(mean), Array1::from(var))?;
        references.push(Array1::from(read(&format!("reference.{i}"))?));
    }

    let optimizer = Adam::from_parts(scalars, read("optimizer.v")?, read("optimizer.s")?)?;
    if optimizer.len() != params.len() {
        return Err(invalid(format!(
            "optimizer state holds {} values for {} parameters",
            optimizer.len(),
            params.len()
        )));
    }

    Ok(Checkpoint {
        model,
        params,
        optimizer,
        epoch,
        acc,
        logs,
        references,
    })
}

fn invalid(msg: String) -> TransferErr {
    TransferErr::InvalidCheckpoint(msg)
}
