//! Driver core: masking, priorities, and the claim/complete cycle.

use log::{debug, warn};
use spin::Mutex;

use crate::consts::{RegLayout, PLIC_NUM_SOURCES};
use crate::platform::Platform;

/// Interrupt service routine. Receives the source ID it was claimed for.
pub type IsrHandler = fn(u32);

/// Controller constants handed over by the board layer.
#[derive(Clone, Copy, Debug)]
pub struct PlicParams {
    /// Number of wired interrupt sources; valid IDs are `1..=num_sources`.
    pub num_sources: u32,
    /// Highest priority level the controller implements.
    pub max_priority: u32,
    /// Geometry of the register block.
    pub layout: RegLayout,
}

/// One Platform-Level Interrupt Controller.
///
/// All controller state lives in hardware registers; the only software
/// state is the handler table. Per-hart registers are addressed through
/// the hart ID read from the platform at each call, so configuration
/// calls act on whichever hart issues them.
pub struct Plic<P> {
    platform: P,
    params: PlicParams,
    handlers: Mutex<[Option<IsrHandler>; PLIC_NUM_SOURCES]>,
}

impl<P: Platform> Plic<P> {
    pub fn new(platform: P, params: PlicParams) -> Self {
        let n = params.num_sources as usize;
        assert!(
            n >= 1 && n < PLIC_NUM_SOURCES,
            "plic: {n} sources, controller architecture allows 1..=1023"
        );
        Self {
            platform,
            params,
            handlers: Mutex::new([None; PLIC_NUM_SOURCES]),
        }
    }

    /// Puts every source into its inert state (disabled, priority 0) and
    /// opens this hart's threshold to all nonzero priorities.
    ///
    /// Safe to run again at any time to re-quiesce the controller, but it
    /// drops any claim outstanding on this hart, so never run it
    /// concurrently with interrupt service.
    pub fn init(&self) {
        for irq in 1..=self.params.num_sources {
            self.disable(irq);
            self.set_priority(irq, 0);
        }
        self.set_threshold(0);
        debug!(
            "plic: {} sources quiesced, threshold 0 on hart {}",
            self.params.num_sources,
            self.platform.hart_id()
        );
    }

    /// Lets `irq` take part in claim arbitration on the calling hart.
    ///
    /// Read-modify-write of one enable word. The register access itself
    /// is atomic, the sequence is not: concurrent enable/disable of
    /// sources sharing a word must be serialized by the caller, e.g. by
    /// running with interrupts masked.
    pub fn enable(&self, irq: u32) {
        self.check_source(irq);
        let reg = self.params.layout.enable_word(self.platform.hart_id(), irq);
        let word = self.platform.reg_read(reg);
        self.platform.reg_write(reg, word | 1 << (irq % 32));
    }

    /// Removes `irq` from claim arbitration on the calling hart.
    pub fn disable(&self, irq: u32) {
        self.check_source(irq);
        let reg = self.params.layout.enable_word(self.platform.hart_id(), irq);
        let word = self.platform.reg_read(reg);
        self.platform.reg_write(reg, word & !(1 << (irq % 32)));
    }

    /// Sets the arbitration priority of `irq`. Priority 0 parks the
    /// source: it never interrupts regardless of its enable bit.
    pub fn set_priority(&self, irq: u32, value: u32) {
        self.check_source(irq);
        self.check_priority(value);
        self.platform
            .reg_write(self.params.layout.priority_reg(irq), value);
    }

    /// Sets the calling hart's priority floor. Sources at or below the
    /// threshold are held back from claims on this hart.
    pub fn set_threshold(&self, value: u32) {
        self.check_priority(value);
        let reg = self.params.layout.threshold_reg(self.platform.hart_id());
        self.platform.reg_write(reg, value);
    }

    /// Whether `irq` is latched pending in the controller.
    pub fn is_pending(&self, irq: u32) -> bool {
        self.check_source(irq);
        let word = self.platform.reg_read(self.params.layout.pending_word(irq));
        word & (1 << (irq % 32)) != 0
    }

    /// Installs the service routine for `irq`, replacing any previous
    /// one. Pure table mutation; the source still has to be enabled and
    /// given a nonzero priority separately.
    pub fn set_handler(&self, irq: u32, handler: IsrHandler) {
        self.check_source(irq);
        self.handlers.lock()[irq as usize] = Some(handler);
    }

    /// Entry point for the external-interrupt trap path.
    ///
    /// Claims the winning source, runs its handler, then signals
    /// completion. The three steps happen on one hart in that order with
    /// no second claim in between; that sequencing is what keeps every
    /// occurrence serviced exactly once.
    pub fn handle_interrupt(&self) {
        let irq = self.claim();
        if irq == 0 {
            // Another hart won the race, or the source was masked after
            // the trap was taken. Nothing to service, nothing to complete.
            warn!("plic: spurious external interrupt");
            return;
        }
        // Copy the slot out so the handler never runs under the lock.
        let handler = self.handlers.lock()[irq as usize];
        match handler {
            Some(isr) => isr(irq),
            None => panic!("plic: claimed irq {irq} has no registered handler"),
        }
        self.complete(irq);
    }

    /// Asks the controller for the highest-priority pending source that
    /// is enabled and above threshold on this hart, marking it in
    /// service. 0 means nothing was eligible.
    pub(crate) fn claim(&self) -> u32 {
        let reg = self
            .params
            .layout
            .claim_complete_reg(self.platform.hart_id());
        self.platform.reg_read(reg)
    }

    /// Retires the claim taken on this hart. `irq` must be the ID the
    /// most recent claim returned.
    pub(crate) fn complete(&self, irq: u32) {
        let reg = self
            .params
            .layout
            .claim_complete_reg(self.platform.hart_id());
        self.platform.reg_write(reg, irq);
    }

    fn check_source(&self, irq: u32) {
        let n = self.params.num_sources;
        assert!(
            irq >= 1 && irq <= n,
            "plic: source id {irq} outside 1..={n}"
        );
    }

    fn check_priority(&self, value: u32) {
        let max = self.params.max_priority;
        assert!(value <= max, "plic: priority {value} above maximum {max}");
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use super::*;
    use crate::sim::SimPlic;

    fn driver(sim: &SimPlic, num_sources: u32) -> Plic<&SimPlic> {
        Plic::new(
            sim,
            PlicParams {
                num_sources,
                max_priority: 7,
                layout: RegLayout::MACHINE,
            },
        )
    }

    #[test]
    fn init_quiesces_every_source() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 4);

        plic.set_priority(2, 5);
        plic.enable(2);
        plic.set_threshold(3);

        plic.init();

        for irq in 1..=4 {
            assert!(!sim.is_enabled(0, irq), "irq {irq} still enabled");
            assert_eq!(sim.priority_of(irq), 0, "irq {irq} still prioritized");
        }
        assert_eq!(sim.threshold_of(0), 0);
    }

    #[test]
    fn masking_is_bit_precise() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 64);

        plic.enable(3);
        plic.enable(4);
        plic.enable(5);
        plic.enable(33);

        plic.disable(4);

        assert!(sim.is_enabled(0, 3));
        assert!(!sim.is_enabled(0, 4));
        assert!(sim.is_enabled(0, 5));
        assert!(sim.is_enabled(0, 33));
    }

    #[test]
    fn enable_targets_the_calling_hart() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 4);

        sim.set_context(1);
        plic.enable(2);

        assert!(sim.is_enabled(1, 2));
        assert!(!sim.is_enabled(0, 2));
    }

    #[test]
    fn claim_complete_rearms_the_source() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 4);

        plic.set_priority(2, 1);
        plic.enable(2);

        sim.raise(2);
        assert_eq!(plic.claim(), 2);
        plic.complete(2);

        sim.raise(2);
        assert_eq!(plic.claim(), 2);
    }

    #[test]
    #[should_panic(expected = "while irq 2 is in service")]
    fn completing_the_wrong_id_is_flagged() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 4);

        plic.set_priority(2, 1);
        plic.enable(2);
        sim.raise(2);

        assert_eq!(plic.claim(), 2);
        plic.complete(3);
    }

    #[test]
    #[should_panic(expected = "no outstanding claim")]
    fn completing_twice_is_flagged() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 4);

        plic.set_priority(2, 1);
        plic.enable(2);
        sim.raise(2);

        assert_eq!(plic.claim(), 2);
        plic.complete(2);
        plic.complete(2);
    }

    #[test]
    fn higher_priority_wins_arbitration() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 4);

        plic.set_priority(1, 2);
        plic.set_priority(3, 6);
        plic.enable(1);
        plic.enable(3);

        sim.raise(1);
        sim.raise(3);

        assert_eq!(plic.claim(), 3);
        plic.complete(3);
        assert_eq!(plic.claim(), 1);
    }

    #[test]
    fn threshold_filters_and_releases() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 4);

        plic.set_priority(1, 3);
        plic.enable(1);
        sim.raise(1);

        plic.set_threshold(3);
        assert_eq!(plic.claim(), 0);

        plic.set_threshold(2);
        assert_eq!(plic.claim(), 1);
    }

    #[test]
    fn dispatch_runs_the_handler_once_and_completes() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static CLAIMED: AtomicU32 = AtomicU32::new(0);

        fn isr(irq: u32) {
            CALLS.fetch_add(1, Ordering::Relaxed);
            CLAIMED.store(irq, Ordering::Relaxed);
        }

        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 8);

        plic.set_handler(5, isr);
        plic.set_priority(5, 4);
        plic.enable(5);
        sim.raise(5);

        plic.handle_interrupt();

        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(CLAIMED.load(Ordering::Relaxed), 5);
        assert!(!sim.in_service(5), "completion was not signaled");
        assert_eq!(plic.claim(), 0);
    }

    #[test]
    fn spurious_dispatch_is_harmless() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 4);

        // Nothing pending: the claim comes back 0 and must not be
        // completed or dispatched.
        plic.handle_interrupt();
    }

    #[test]
    #[should_panic(expected = "no registered handler")]
    fn dispatch_without_handler_is_fatal() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 4);

        plic.set_priority(2, 1);
        plic.enable(2);
        sim.raise(2);

        plic.handle_interrupt();
    }

    #[test]
    #[should_panic(expected = "source id 0")]
    fn priority_for_reserved_id_is_rejected() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        driver(&sim, 4).set_priority(0, 1);
    }

    #[test]
    #[should_panic(expected = "source id 0")]
    fn handler_for_reserved_id_is_rejected() {
        fn isr(_irq: u32) {}
        let sim = SimPlic::new(RegLayout::MACHINE);
        driver(&sim, 4).set_handler(0, isr);
    }

    #[test]
    #[should_panic(expected = "source id 5")]
    fn enable_past_the_last_source_is_rejected() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        driver(&sim, 4).enable(5);
    }

    #[test]
    #[should_panic(expected = "priority 8 above maximum 7")]
    fn priority_above_maximum_is_rejected() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        driver(&sim, 4).set_priority(1, 8);
    }

    #[test]
    fn pending_query_reflects_raised_lines() {
        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 64);

        assert!(!plic.is_pending(33));
        sim.raise(33);
        assert!(plic.is_pending(33));
    }

    #[test]
    fn end_to_end_two_sources() {
        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());

        fn isr(irq: u32) {
            ORDER.lock().push(irq);
        }

        let sim = SimPlic::new(RegLayout::MACHINE);
        let plic = driver(&sim, 4);

        plic.init();
        plic.set_handler(2, isr);
        plic.set_handler(4, isr);
        plic.set_priority(2, 3);
        plic.set_priority(4, 7);
        plic.enable(2);
        plic.enable(4);
        plic.set_threshold(0);

        sim.raise(2);
        sim.raise(4);

        plic.handle_interrupt();
        plic.handle_interrupt();

        assert_eq!(*ORDER.lock(), vec![4, 2]);
        assert_eq!(plic.claim(), 0);
    }
}
