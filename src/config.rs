//! Configuration loading and pipeline assembly (C6, §6).
//!
//! A [`LensConfig`] names an ordered list of lens modules and, optionally,
//! arguments to apply to each via `set_param`. [`load`]/[`load_into`] resolve
//! every module's bytes, compile and instantiate them, apply arguments, and
//! hand the resulting instances to [`compose`] to build the final pipeline.
//!
//! Module bytes are content-addressed: within one `load`/`load_into` call,
//! two stages whose resolved bytes hash to the same SHA-256 digest share one
//! [`CompiledModule`] (§4.5), though each stage still gets its own
//! [`Instance`] unless a stage is deliberately reused across positions by
//! the caller.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::compose;
use crate::error::{LensError, Result};
use crate::pipe::Pipe;
use crate::runtime::wasmtime_backend::WasmtimeRuntime;
use crate::runtime::{CompiledModule, Instance, Runtime};
use crate::source::Source;
use crate::wire::Frame;

/// A lens pipeline configuration: an ordered list of stages to apply, in
/// order, to the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensConfig {
    pub lenses: Vec<LensStage>,
}

/// One stage of a [`LensConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensStage {
    /// A local path, or a `file:`/`http:`/`https:` URL, to the module's
    /// `.wasm` bytes. Ignored if `content` is present.
    #[serde(default)]
    pub path: Option<String>,

    /// The module's `.wasm` bytes, base64-encoded inline. Takes precedence
    /// over `path` when both are present.
    #[serde(default)]
    pub content: Option<String>,

    /// Run the module's `inverse` export instead of `transform`.
    #[serde(default)]
    pub inverse: bool,

    /// Parameters to pass to the module's `set_param` export, if any. A
    /// missing value, a JSON `null`, or an empty object are all equivalent
    /// to omitting `arguments` entirely (§9 Open Question 2): `set_param`
    /// is only called when there is at least one argument to deliver.
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl LensConfig {
    pub fn from_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| LensError::Config(e.to_string()))
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        serde_json::from_reader(reader).map_err(|e| LensError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }
}

/// Module bytes keyed by content hash. Passing the same cache into more
/// than one `load_into` call lets a long-lived host reuse already-compiled
/// modules across pipelines instead of recompiling identical bytes every
/// time (§4.5 "incremental variant").
pub type ModuleCache = HashMap<[u8; 32], Rc<dyn CompiledModule>>;

/// Builds a pipeline over `source`, applying `config`'s stages in order,
/// without changing the element type, using a fresh [`WasmtimeRuntime`] and
/// a cache scoped to this call alone. For a long-lived host that wants to
/// reuse compiled modules across many calls, use [`load_into`] instead with
/// a [`ModuleCache`] kept alive between them.
pub fn load<T>(config: &LensConfig, source: Box<dyn Source<T>>) -> Result<Box<dyn Pipe<T>>>
where
    T: Serialize + DeserializeOwned + 'static,
{
    let runtime = WasmtimeRuntime::new();
    let mut cache = ModuleCache::new();
    if config.lenses.is_empty() {
        return Ok(compose::identity(source));
    }
    let instances = instantiate_stages(config, &runtime, &mut cache)?;
    Ok(compose::load::<T, T>(source, instances))
}

/// Builds a pipeline over `source` that converts `S` values into `R` values
/// via `config`'s stages, compiling modules through `runtime` and reusing
/// (extending in place) whatever's already in `cache`. Requires at least
/// one stage: with none, there is no lens boundary at which `S` could
/// become `R`.
///
/// Pass the same `cache` to successive calls to skip recompiling a module
/// whose content hash was already seen (§4.5).
pub fn load_into<S, R>(
    runtime: &dyn Runtime,
    cache: &mut ModuleCache,
    config: &LensConfig,
    source: Box<dyn Source<S>>,
) -> Result<Box<dyn Pipe<R>>>
where
    S: Serialize + 'static,
    R: DeserializeOwned + 'static,
{
    if config.lenses.is_empty() {
        return Err(LensError::Config(
            "cannot convert between source and result types with zero lens stages".to_string(),
        ));
    }
    let instances = instantiate_stages(config, runtime, cache)?;
    Ok(compose::load::<S, R>(source, instances))
}

fn instantiate_stages(
    config: &LensConfig,
    runtime: &dyn Runtime,
    cache: &mut ModuleCache,
) -> Result<Vec<Rc<dyn Instance>>> {
    let mut instances = Vec::with_capacity(config.lenses.len());

    for stage in &config.lenses {
        let bytes = resolve_bytes(stage)?;
        let digest: [u8; 32] = Sha256::digest(&bytes).into();

        let compiled = match cache.get(&digest) {
            Some(compiled) => {
                log::debug!("reusing compiled module for content hash {}", hex(&digest));
                compiled.clone()
            }
            None => {
                let compiled = runtime.compile(&bytes)?;
                cache.insert(digest, compiled.clone());
                compiled
            }
        };

        let export_name = if stage.inverse { "inverse" } else { "transform" };
        let instance: Rc<dyn Instance> = Rc::from(compiled.instantiate(export_name)?);
        apply_arguments(instance.as_ref(), &stage.arguments)?;
        instances.push(instance);
    }

    Ok(instances)
}

fn apply_arguments(instance: &dyn Instance, arguments: &Option<Value>) -> Result<()> {
    let arguments = match arguments {
        Some(Value::Object(map)) if !map.is_empty() => map,
        Some(Value::Object(_)) | Some(Value::Null) | None => return Ok(()),
        Some(_) => {
            return Err(LensError::Config(
                "lens stage `arguments` must be a JSON object".to_string(),
            ))
        }
    };

    if !instance.has_set_param() {
        return Err(LensError::ExportMissing("set_param".to_string()));
    }

    let payload = serde_json::to_vec(arguments)?;
    let frame = Frame::Json(payload).encode();
    let address = instance.alloc(frame.len() as u32)?;
    instance.write_raw(address, &frame)?;
    let result_address = instance.set_param(address)?;
    instance.free(address, frame.len() as u32)?;

    let (result_frame, result_len) = instance.read_frame(result_address)?;
    instance.free(result_address, result_len)?;

    match result_frame {
        // Nil (or anything else the guest chooses to return) is success
        // (§9 Open Question 3); only an explicit error frame is fatal.
        Frame::Error(message) => Err(LensError::Param(message)),
        _ => Ok(()),
    }
}

fn resolve_bytes(stage: &LensStage) -> Result<Vec<u8>> {
    if let Some(content) = &stage.content {
        return BASE64
            .decode(content)
            .map_err(|e| LensError::Config(format!("invalid base64 in `content`: {e}")));
    }

    let path = stage
        .path
        .as_ref()
        .ok_or_else(|| LensError::Config("lens stage has neither `content` nor `path`".to_string()))?;
    resolve_path(path)
}

fn resolve_path(path: &str) -> Result<Vec<u8>> {
    match url::Url::parse(path) {
        Ok(url) => match url.scheme() {
            "file" => {
                let file_path = url
                    .to_file_path()
                    .map_err(|_| LensError::Resolve(format!("invalid file URL: {path}")))?;
                std::fs::read(&file_path).map_err(|e| LensError::Resolve(format!("{path}: {e}")))
            }
            "http" | "https" => {
                let response = reqwest::blocking::get(url.clone())
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| LensError::Resolve(format!("{path}: {e}")))?;
                response
                    .bytes()
                    .map(|b| b.to_vec())
                    .map_err(|e| LensError::Resolve(format!("{path}: {e}")))
            }
            other => Err(LensError::Resolve(format!(
                "unsupported module URL scheme `{other}`"
            ))),
        },
        // Not parseable as a URL: treat it as a plain filesystem path.
        Err(_) => std::fs::read(path).map_err(|e| LensError::Resolve(format!("{path}: {e}"))),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
