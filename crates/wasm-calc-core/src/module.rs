//! Guest module compilation and loading.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that handles compilation, serialization, and deserialization of the guest,
//! and checks it against the calculator calling convention before any instance
//! is created.
//!
//! # Sources
//!
//! - **Bundled**: the calculator guest shipped with this crate (WAT)
//! - **File**: `.wasm`, `.wat`, or an AOT-compiled `.cwasm`
//! - **Bytes / WAT text**: supplied by the caller

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::{Engine, ExternType, Module};

use wasm_calc_common::RuntimeError;

use crate::guest::{self, CALCULATOR_WAT};

/// A compiled guest module.
///
/// # Thread Safety
///
/// `CompiledModule` is thread-safe and is shared by every instance in a pool.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// Hash of the original Wasm bytes or WAT text.
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile the bundled calculator guest.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    pub fn bundled(engine: &Engine) -> Result<Self, RuntimeError> {
        Self::from_wat(engine, CALCULATOR_WAT)
    }

    /// Compile a guest from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid Wasm module or the
    /// module does not follow the guest calling convention.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Guest module compilation failed: {e}"))
        })?;

        let compiled = Self::wrap(module, compute_hash(bytes))?;

        info!(
            content_hash = %compiled.content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Guest module compiled"
        );

        Ok(compiled)
    }

    /// Compile a guest from WAT (WebAssembly Text Format).
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails or the module does not follow
    /// the guest calling convention.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let compiled = Self::wrap(module, compute_hash(wat.as_bytes()))?;

        info!(
            content_hash = %compiled.content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT guest compiled"
        );

        Ok(compiled)
    }

    /// Load a guest from disk, choosing the loader by file extension.
    ///
    /// `.wat` is compiled from text, `.cwasm` is deserialized as a
    /// precompiled artifact, anything else is treated as a Wasm binary.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or compiled.
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("cwasm") => Self::from_precompiled(engine, path),
            Some("wat") => {
                let wat = std::fs::read_to_string(path)?;
                Self::from_wat(engine, &wat)
            }
            _ => {
                let bytes = std::fs::read(path)?;
                Self::from_bytes(engine, &bytes)
            }
        }
    }

    /// Load a pre-compiled guest from disk.
    ///
    /// # Safety
    ///
    /// This deserializes pre-compiled machine code. Only load artifacts that
    /// were produced by [`CompiledModule::serialize`] with the same Wasmtime
    /// version and engine settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be loaded or is incompatible.
    #[allow(unsafe_code)]
    #[instrument(skip(engine, path))]
    pub fn from_precompiled(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let start = Instant::now();

        // SAFETY: artifacts are produced by `serialize` on a matching engine
        let module = unsafe { Module::deserialize_file(engine, path) }.map_err(|e| {
            RuntimeError::compilation_failed(format!(
                "Failed to load precompiled guest from {}: {e}",
                path.display()
            ))
        })?;

        // Hash convention for AOT artifacts: {hash}.cwasm
        let content_hash = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let compiled = Self::wrap(module, content_hash)?;

        debug!(
            path = %path.display(),
            content_hash = %compiled.content_hash,
            duration_us = start.elapsed().as_micros(),
            "Precompiled guest loaded"
        );

        Ok(compiled)
    }

    /// Serialize the compiled module for AOT caching.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn serialize(&self) -> Result<Vec<u8>, RuntimeError> {
        self.inner.serialize().map_err(|e| {
            RuntimeError::compilation_failed(format!("Module serialization failed: {e}"))
        })
    }

    /// Get the content hash of the original source.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Get the inner Wasmtime module.
    pub fn module(&self) -> &Module {
        &self.inner
    }

    /// Check if the guest exports the optional clock entry point.
    pub fn has_clock(&self) -> bool {
        self.inner.get_export(guest::NOW_EXPORT).is_some()
    }

    fn wrap(module: Module, content_hash: String) -> Result<Self, RuntimeError> {
        Self::validate_exports(&module)?;

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Check the exports the invoker cannot work without.
    ///
    /// Signatures are checked when the typed functions are resolved at
    /// instantiation; here only presence and kind are verified.
    fn validate_exports(module: &Module) -> Result<(), RuntimeError> {
        match module.get_export(guest::MEMORY_EXPORT) {
            Some(ExternType::Memory(_)) => {}
            _ => return Err(RuntimeError::missing_export(guest::MEMORY_EXPORT)),
        }

        for name in [
            guest::ALLOC_EXPORT,
            guest::DEALLOC_EXPORT,
            guest::PARSE_EXPORT,
        ] {
            if !matches!(module.get_export(name), Some(ExternType::Func(_))) {
                return Err(RuntimeError::missing_export(name));
            }
        }

        Ok(())
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("has_clock", &self.has_clock())
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use wasm_calc_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_validate_wasm_header_valid() {
        assert!(CompiledModule::validate_wasm_header(MINIMAL_WASM).is_ok());
    }

    #[test]
    fn test_validate_wasm_header_too_small() {
        let result = CompiledModule::validate_wasm_header(&[0x00, 0x61]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_wasm_header_bad_magic() {
        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let result = CompiledModule::validate_wasm_header(bad_wasm);
        assert!(result.is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_bundled_guest_compiles() {
        let engine = engine();
        let module = CompiledModule::bundled(engine.inner()).unwrap();

        assert!(module.has_clock());
        assert!(!module.content_hash().is_empty());
    }

    #[test]
    fn test_empty_module_rejected() {
        let engine = engine();
        let result = CompiledModule::from_bytes(engine.inner(), MINIMAL_WASM);

        assert!(matches!(result, Err(RuntimeError::MissingExport { name }) if name == "memory"));
    }

    #[test]
    fn test_missing_parse_rejected() {
        let engine = engine();
        let wat = r#"
            (module
                (memory (export "memory") 1)
                (func (export "alloc") (param i32) (result i32) (i32.const 0))
                (func (export "dealloc") (param i32 i32))
            )
        "#;

        let result = CompiledModule::from_wat(engine.inner(), wat);
        assert!(matches!(result, Err(RuntimeError::MissingExport { name }) if name == "parse"));
    }

    #[test]
    fn test_serialize_roundtrip_through_file() {
        let engine = engine();
        let module = CompiledModule::bundled(engine.inner()).unwrap();
        let bytes = module.serialize().unwrap();

        let path = std::env::temp_dir().join(format!("{}.cwasm", module.content_hash()));
        std::fs::write(&path, bytes).unwrap();

        let loaded = CompiledModule::from_file(engine.inner(), &path).unwrap();
        assert_eq!(loaded.content_hash(), module.content_hash());
        assert!(loaded.has_clock());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_module_debug() {
        let engine = engine();
        let module = CompiledModule::bundled(engine.inner()).unwrap();

        let debug_str = format!("{module:?}");
        assert!(debug_str.contains("CompiledModule"));
        assert!(debug_str.contains("content_hash"));
    }
}
