//! picvm: polymorphic inline caching for a register bytecode VM
//!
//! Every dynamically dispatched instruction (multi-dispatch operator, method
//! call, attribute access) owns an inline cache: one fast slot plus a small
//! overflow set carved out of its code segment's [`cache::CacheStore`]. The
//! [`vm::DispatchEngine`] consults it before falling back to full resolution,
//! and [`jit::JitSafetyAnalyzer`] reads it to decide whether a site's target
//! may be compiled ahead of time.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use picvm::cache::StoreRegistry;
//! use picvm::util::config::EngineConfig;
//! use picvm::vm::{DispatchEngine, InfixOp, Instruction, Opcode, ProgramCounter};
//! use picvm::vm::{SegmentBuilder, SegmentId, TypeRegistry};
//!
//! let mut b = SegmentBuilder::new(SegmentId(0));
//! b.chunk("main", vec![
//!     Instruction::op3(Opcode::SetImm, 0, 0, 2),
//!     Instruction::op3(Opcode::SetImm, 1, 0, 40),
//!     Instruction::new(Opcode::Infix, [2, 0, 1, InfixOp::Add as u32]),
//!     Instruction::op1(Opcode::Exit, 2),
//! ]);
//! let segment = Arc::new(b.build().unwrap());
//! let store = StoreRegistry::default().on_segment_load(&segment);
//! let mut engine = DispatchEngine::new(
//!     segment,
//!     store,
//!     Arc::new(TypeRegistry::with_builtins()),
//!     EngineConfig::default(),
//! );
//! assert_eq!(engine.dispatch_run(ProgramCounter::new(0, 0), &[]).unwrap(), 42);
//! ```

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod image;
pub mod jit;
pub mod util;
pub mod vm;

// Re-exports
pub use anyhow::{Context, Result};

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::cache::StoreRegistry;
use crate::image::{LoadedImage, ProgramImage};
use crate::util::config::PicvmConfig;
use crate::vm::DispatchEngine;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "picvm";

/// Read and load a program image
pub fn load_image(path: &Path) -> Result<LoadedImage> {
    debug!("reading image {}", path.display());
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read image: {}", path.display()))?;
    let image = ProgramImage::from_path_text(path, &text)
        .with_context(|| format!("Failed to parse image: {}", path.display()))?;
    image
        .load()
        .with_context(|| format!("Failed to load image: {}", path.display()))
}

/// Engine for a loaded image, with its cache store registered in `stores`
pub fn engine_for(
    loaded: &LoadedImage,
    config: &PicvmConfig,
    stores: &mut StoreRegistry,
) -> DispatchEngine {
    let store = stores.on_segment_load(&loaded.segment);
    DispatchEngine::new(
        loaded.segment.clone(),
        store,
        Arc::new(loaded.registry.clone()),
        config.engine.clone(),
    )
}

/// Run an image to completion and return its exit code
pub fn run_image(
    path: &Path,
    config: &PicvmConfig,
) -> Result<i32> {
    let loaded = load_image(path)?;
    let mut stores = StoreRegistry::new(config.cache.policy(), config.cache.arena_regions_per_site);
    let mut engine = engine_for(&loaded, config, &mut stores);
    let code = engine
        .dispatch_run(loaded.entry, &[])
        .with_context(|| format!("Execution of {} failed", path.display()))?;
    Ok(code)
}
