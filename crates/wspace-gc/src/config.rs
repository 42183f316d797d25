//! Collector configuration and verifier option parsing

use crate::error::{GcError, Result};

/// How the scanner treats the referent field of soft/weak/phantom references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferentPolicy {
    /// Reference objects are reported to the reference processor and their
    /// referent is not traced as a strong edge
    #[default]
    BuiltIn,
    /// Referent fields are ordinary strong fields
    Strong,
}

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Mature space size in bytes (default: 16MB)
    pub heap_size: usize,
    /// Nursery size in bytes (default: 1MB)
    pub nursery_size: usize,
    /// Number of global root cells (default: 4096)
    pub root_capacity: usize,
    /// Size of a normal (slotted) chunk in bytes (default: 64KB)
    pub normal_chunk_size: usize,
    /// Chunk carving granule in bytes (default: 4KB)
    pub chunk_granule: usize,
    /// Number of collector threads used for marking and sweeping
    pub collector_threads: usize,
    /// Free-slot fraction above which a swept chunk is reused for allocation
    pub pfc_reuse_ratio: f64,
    /// Entries per task-pool vector block (default: 256)
    pub task_block_capacity: usize,
    /// Trace class objects through their vtable once per cycle
    pub trace_classes: bool,
    /// Treatment of reference-object referents
    pub referent_policy: ReferentPolicy,
    /// Clear softly reachable referents instead of retaining them
    pub clear_soft_references: bool,
    /// Comma-separated verifier options (`rootset`, `writebarrier`,
    /// `allocation`, `gc`, `default`, `all`); `None` disables verification
    pub verify: Option<String>,
    /// Blocks available to the verifier trace stack
    pub verifier_block_limit: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4);
        Self {
            heap_size: 16 * 1024 * 1024,    // 16MB
            nursery_size: 1024 * 1024,      // 1MB
            root_capacity: 4096,
            normal_chunk_size: 64 * 1024,   // 64KB
            chunk_granule: 4 * 1024,        // 4KB
            collector_threads: threads,
            pfc_reuse_ratio: 0.1,
            task_block_capacity: 256,
            trace_classes: false,
            referent_policy: ReferentPolicy::BuiltIn,
            clear_soft_references: false,
            verify: None,
            verifier_block_limit: 4096,
        }
    }
}

impl GcConfig {
    /// Check sizes for consistency
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(GcError::InvalidConfig(msg.to_string()));
        if self.chunk_granule == 0 || !self.chunk_granule.is_multiple_of(8) {
            return invalid("chunk_granule must be a non-zero multiple of 8");
        }
        if self.normal_chunk_size == 0 || !self.normal_chunk_size.is_multiple_of(self.chunk_granule)
        {
            return invalid("normal_chunk_size must be a multiple of chunk_granule");
        }
        if self.heap_size < self.normal_chunk_size
            || !self.heap_size.is_multiple_of(self.chunk_granule)
        {
            return invalid("heap_size must hold a normal chunk and be granule aligned");
        }
        if !self.nursery_size.is_multiple_of(8) {
            return invalid("nursery_size must be word aligned");
        }
        if self.collector_threads == 0 {
            return invalid("collector_threads must be at least 1");
        }
        if self.task_block_capacity == 0 {
            return invalid("task_block_capacity must be at least 1");
        }
        if !(0.0..1.0).contains(&self.pfc_reuse_ratio) {
            return invalid("pfc_reuse_ratio must be in [0, 1)");
        }
        Ok(())
    }
}

/// Usage text logged when the verifier option string cannot be parsed
pub const VERIFY_USAGE: &str = "verify options: comma-separated list of \
     rootset, writebarrier, allocation, gc, default (rootset,gc), all";

/// Verifier checks selected by the option string
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Validate root slots
    pub rootset: bool,
    /// Check remembered-set completeness
    pub writebarrier: bool,
    /// Check chunk allocation bookkeeping
    pub allocation: bool,
    /// Snapshot the live graph before and after each cycle and compare
    pub gc: bool,
}

impl VerifyOptions {
    /// Every check enabled
    pub fn all() -> Self {
        Self {
            rootset: true,
            writebarrier: true,
            allocation: true,
            gc: true,
        }
    }

    /// Parse a comma-separated option string
    pub fn parse(input: &str) -> Result<Self> {
        let mut options = Self::default();
        for item in input.split(',') {
            match item.trim() {
                "rootset" => options.rootset = true,
                "writebarrier" => options.writebarrier = true,
                "allocation" => options.allocation = true,
                "gc" => options.gc = true,
                "default" => {
                    options.rootset = true;
                    options.gc = true;
                }
                "all" => options = Self::all(),
                "" => return Err(GcError::InvalidVerifyOption("empty item".to_string())),
                other => return Err(GcError::InvalidVerifyOption(other.to_string())),
            }
        }
        Ok(options)
    }

    /// Whether any check is selected
    pub fn is_enabled(&self) -> bool {
        self.rootset || self.writebarrier || self.allocation || self.gc
    }
}
