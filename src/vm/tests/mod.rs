//! VM 模块测试
//!
//! 执行器、调试器桥、帧与指令编码的单元测试


use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::StoreRegistry;
use crate::util::config::EngineConfig;
use crate::vm::executor::DispatchEngine;
use crate::vm::instructions::Instruction;
use crate::vm::resolver::TypeRegistry;
use crate::vm::segment::{CodeSegment, SegmentBuilder, SegmentId};

/// Engine plus a captured print sink
pub(crate) struct Harness {
    pub engine: DispatchEngine,
    pub out: Arc<Mutex<Vec<u8>>>,
}

impl Harness {
    pub fn new(
        segment: CodeSegment,
        registry: TypeRegistry,
    ) -> Self {
        Self::with_config(segment, registry, EngineConfig::default())
    }

    pub fn with_config(
        segment: CodeSegment,
        registry: TypeRegistry,
        config: EngineConfig,
    ) -> Self {
        let segment = Arc::new(segment);
        let store = StoreRegistry::default().on_segment_load(&segment);
        let mut engine = DispatchEngine::new(segment, store, Arc::new(registry), config);
        let out = Arc::new(Mutex::new(Vec::new()));
        engine.set_stdout(out.clone());
        Self { engine, out }
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.out.lock()).into_owned()
    }
}

/// Segment with one chunk and no subroutines
pub(crate) fn single_chunk(code: Vec<Instruction>) -> CodeSegment {
    let mut b = SegmentBuilder::new(SegmentId(0));
    b.chunk("main", code);
    b.build().unwrap()
}
