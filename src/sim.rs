//! Software model of the controller register protocol.
//!
//! [`SimPlic`] stands in for the hardware behind the [`Platform`] seam:
//! it decodes the same byte offsets the driver computes and keeps the
//! controller state (priorities, enable words, thresholds, pending and
//! in-service sets) in memory. A claim read performs the real
//! arbitration — enabled, pending, not in service, priority above the
//! context's threshold, highest priority first, lowest ID on a tie — and
//! a completion write is checked against the context's outstanding claim
//! so protocol violations surface as panics instead of silent state
//! corruption.

use core::sync::atomic::{AtomicUsize, Ordering};

use bitmaps::Bitmap;
use spin::Mutex;

use crate::consts::{
    RegLayout, PLIC_CONTEXT_CLAIM_COMPLETE_OFFSET, PLIC_CONTEXT_THRESHOLD_OFFSET,
    PLIC_NUM_SOURCES,
};
use crate::platform::Platform;

const ENABLE_WORDS: usize = PLIC_NUM_SOURCES / 32;

/// Number of contexts the model keeps state for.
pub const SIM_CONTEXTS: usize = 4;

/// In-memory controller with a selectable current hart.
pub struct SimPlic {
    layout: RegLayout,
    /// Hart the next driver call appears to run on.
    context: AtomicUsize,
    state: Mutex<SimState>,
}

struct SimState {
    priority: [u32; PLIC_NUM_SOURCES],
    pending: Bitmap<{ PLIC_NUM_SOURCES }>,
    in_service: Bitmap<{ PLIC_NUM_SOURCES }>,
    enable: [[u32; ENABLE_WORDS]; SIM_CONTEXTS],
    threshold: [u32; SIM_CONTEXTS],
    last_claim: [Option<u32>; SIM_CONTEXTS],
}

impl SimPlic {
    pub fn new(layout: RegLayout) -> Self {
        Self {
            layout,
            context: AtomicUsize::new(0),
            state: Mutex::new(SimState {
                priority: [0; PLIC_NUM_SOURCES],
                pending: Bitmap::new(),
                in_service: Bitmap::new(),
                enable: [[0; ENABLE_WORDS]; SIM_CONTEXTS],
                threshold: [0; SIM_CONTEXTS],
                last_claim: [None; SIM_CONTEXTS],
            }),
        }
    }

    /// Latches `irq` pending, as a device raising its line.
    pub fn raise(&self, irq: u32) {
        self.state.lock().pending.set(irq as usize, true);
    }

    /// Selects which hart subsequent register accesses model.
    pub fn set_context(&self, context: usize) {
        assert!(context < SIM_CONTEXTS, "sim models {SIM_CONTEXTS} contexts");
        self.context.store(context, Ordering::Relaxed);
    }

    pub fn priority_of(&self, irq: u32) -> u32 {
        self.state.lock().priority[irq as usize]
    }

    pub fn threshold_of(&self, context: usize) -> u32 {
        self.state.lock().threshold[context]
    }

    pub fn is_enabled(&self, context: usize, irq: u32) -> bool {
        let irq = irq as usize;
        self.state.lock().enable[context][irq / 32] & (1 << (irq % 32)) != 0
    }

    pub fn is_pending(&self, irq: u32) -> bool {
        self.state.lock().pending.get(irq as usize)
    }

    pub fn in_service(&self, irq: u32) -> bool {
        self.state.lock().in_service.get(irq as usize)
    }
}

impl SimState {
    /// The ID the claim register of `ctx` reads as right now.
    fn arbitrate(&self, ctx: usize) -> u32 {
        let mut winner = 0usize;
        let mut best = self.threshold[ctx];
        for irq in 1..PLIC_NUM_SOURCES {
            if !self.pending.get(irq) || self.in_service.get(irq) {
                continue;
            }
            if self.enable[ctx][irq / 32] & (1 << (irq % 32)) == 0 {
                continue;
            }
            // Strictly-above keeps the lowest ID on equal priority, and
            // starting `best` at the threshold filters the floor.
            if self.priority[irq] > best {
                best = self.priority[irq];
                winner = irq;
            }
        }
        winner as u32
    }
}

impl Platform for SimPlic {
    fn reg_read(&self, offset: usize) -> u32 {
        let l = self.layout;
        let st = &mut *self.state.lock();
        match offset {
            o if o >= l.priority_offset && o < l.priority_offset + 4 * PLIC_NUM_SOURCES => {
                st.priority[(o - l.priority_offset) / 4]
            }
            o if o >= l.pending_offset && o < l.pending_offset + 4 * ENABLE_WORDS => {
                let first = (o - l.pending_offset) / 4 * 32;
                let mut word = 0u32;
                for bit in 0..32 {
                    if st.pending.get(first + bit) {
                        word |= 1 << bit;
                    }
                }
                word
            }
            o if o >= l.enable_offset && o < l.enable_offset + SIM_CONTEXTS * l.enable_stride => {
                let ctx = (o - l.enable_offset) / l.enable_stride;
                let word = (o - l.enable_offset) % l.enable_stride / 4;
                st.enable[ctx][word]
            }
            o if o >= l.context_offset
                && o < l.context_offset + SIM_CONTEXTS * l.context_stride =>
            {
                let ctx = (o - l.context_offset) / l.context_stride;
                match (o - l.context_offset) % l.context_stride {
                    PLIC_CONTEXT_THRESHOLD_OFFSET => st.threshold[ctx],
                    PLIC_CONTEXT_CLAIM_COMPLETE_OFFSET => {
                        let irq = st.arbitrate(ctx);
                        if irq != 0 {
                            st.pending.set(irq as usize, false);
                            st.in_service.set(irq as usize, true);
                            st.last_claim[ctx] = Some(irq);
                        }
                        irq
                    }
                    rem => unimplemented!("plic sim: read of context register {rem:#x}"),
                }
            }
            _ => unimplemented!("plic sim: read of unmapped register {offset:#x}"),
        }
    }

    fn reg_write(&self, offset: usize, value: u32) {
        let l = self.layout;
        let st = &mut *self.state.lock();
        match offset {
            o if o >= l.priority_offset && o < l.priority_offset + 4 * PLIC_NUM_SOURCES => {
                st.priority[(o - l.priority_offset) / 4] = value;
            }
            o if o >= l.enable_offset && o < l.enable_offset + SIM_CONTEXTS * l.enable_stride => {
                let ctx = (o - l.enable_offset) / l.enable_stride;
                let word = (o - l.enable_offset) % l.enable_stride / 4;
                st.enable[ctx][word] = value;
            }
            o if o >= l.context_offset
                && o < l.context_offset + SIM_CONTEXTS * l.context_stride =>
            {
                let ctx = (o - l.context_offset) / l.context_stride;
                match (o - l.context_offset) % l.context_stride {
                    PLIC_CONTEXT_THRESHOLD_OFFSET => st.threshold[ctx] = value,
                    PLIC_CONTEXT_CLAIM_COMPLETE_OFFSET => match st.last_claim[ctx] {
                        Some(claimed) if claimed == value => {
                            st.in_service.set(value as usize, false);
                            st.last_claim[ctx] = None;
                        }
                        Some(claimed) => panic!(
                            "plic sim: completion for irq {value} while irq {claimed} is in service"
                        ),
                        None => {
                            panic!("plic sim: completion for irq {value} with no outstanding claim")
                        }
                    },
                    rem => unimplemented!("plic sim: write of context register {rem:#x}"),
                }
            }
            _ => unimplemented!("plic sim: write of unmapped register {offset:#x}"),
        }
    }

    fn hart_id(&self) -> usize {
        self.context.load(Ordering::Relaxed)
    }
}
