use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! translate_counters {
    ($($(#[$meta:meta])* $name:ident => $inc:ident,)*) => {
        /// Telemetry counters for the translation layer.
        ///
        /// Updated with relaxed atomics on the submission thread; safe to read from another thread
        /// (e.g. when forwarded to a profiler overlay).
        #[derive(Debug, Default)]
        pub struct TranslateStats {
            $($(#[$meta])* $name: AtomicU64,)*
        }

        impl TranslateStats {
            $(
                pub fn $inc(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> TranslateStatsSnapshot {
                TranslateStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            /// Reset every counter to zero.
            pub fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }

        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct TranslateStatsSnapshot {
            $(pub $name: u64,)*
        }

        impl TranslateStatsSnapshot {
            /// Hand-built JSON object with one field per counter.
            pub fn to_json(self) -> String {
                let fields: Vec<String> = vec![
                    $(format!("\"{}\":{}", stringify!($name), self.$name),)*
                ];
                format!("{{{}}}", fields.join(","))
            }
        }
    };
}

translate_counters! {
    vertex_direct_binds => inc_vertex_direct_binds,
    vertex_static_hits => inc_vertex_static_hits,
    vertex_static_misses => inc_vertex_static_misses,
    vertex_streamed => inc_vertex_streamed,
    current_value_uploads => inc_current_value_uploads,
    /// Vertex or index translations that ran a conversion/copy loop on the CPU.
    conversions => inc_conversions,
    index_direct_binds => inc_index_direct_binds,
    index_static_hits => inc_index_static_hits,
    index_static_misses => inc_index_static_misses,
    index_streamed => inc_index_streamed,
    index_range_scans => inc_index_range_scans,
    counting_index_rebuilds => inc_counting_index_rebuilds,
    static_promotions => inc_static_promotions,
    static_invalidations => inc_static_invalidations,
    stream_discards => inc_stream_discards,
    stream_regrows => inc_stream_regrows,
    state_calls_issued => inc_state_calls_issued,
    state_calls_skipped => inc_state_calls_skipped,
    vertex_layouts_created => inc_vertex_layouts_created,
    device_losses => inc_device_losses,
    resets_attempted => inc_resets_attempted,
    resets_succeeded => inc_resets_succeeded,
}

impl TranslateStats {
    pub fn new() -> Self {
        Self::default()
    }
}
