/// Engine configuration
///
/// A small, explicitly-constructed config passed once into `vm_init`
/// (`context::EngineState::new`) — no on-disk user preferences, since this
/// crate is a library embedded by a host, not a standalone tool with a
/// `~/.config` of its own. The CLI's flags override fields on a builder
/// before constructing the engine, the same way the teacher's CLI flags
/// override its config struct before constructing a `Runtime`.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Number of slots in the heap arena (`cp_heap::Heap::new`). Must fit
    /// in a `u16`-addressable arena; see `cp_heap::DEFAULT_HEAP_SLOTS`.
    pub heap_slots: usize,
    /// Fraction of `heap_slots` in use that triggers a collection.
    pub gc_high_water_mark: f64,
    /// Maximum VM frame nesting depth before a `RangeError` (stack
    /// overflow) is raised instead of pushing another frame.
    pub max_call_depth: usize,
    /// Always `true` in this engine — kept as an explicit field rather than
    /// a compile-time constant so `EngineConfig` documents that TDZ
    /// enforcement is architectural, not a feature someone could think to
    /// disable.
    pub tdz_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            heap_slots: crate::cp_heap::DEFAULT_HEAP_SLOTS,
            gc_high_water_mark: 0.75,
            max_call_depth: 1024,
            tdz_enabled: true,
        }
    }
}

pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        EngineConfigBuilder { config: EngineConfig::default() }
    }

    pub fn heap_slots(mut self, slots: usize) -> Self {
        self.config.heap_slots = slots;
        self
    }

    pub fn gc_high_water_mark(mut self, ratio: f64) -> Self {
        self.config.gc_high_water_mark = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.config.max_call_depth = depth;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = EngineConfigBuilder::new().heap_slots(256).max_call_depth(16).build();
        assert_eq!(cfg.heap_slots, 256);
        assert_eq!(cfg.max_call_depth, 16);
        assert!(cfg.tdz_enabled);
    }

    #[test]
    fn high_water_mark_is_clamped() {
        let cfg = EngineConfigBuilder::new().gc_high_water_mark(1.5).build();
        assert_eq!(cfg.gc_high_water_mark, 1.0);
    }
}
