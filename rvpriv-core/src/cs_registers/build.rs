//! Construction of the register set from a [`Config`].
//!
//! Storage instances are allocated first; views referring to them by [`CsrId`] are added
//! afterwards, so that no instance ever refers to one that does not exist yet.

use log::debug;
use nohash::IntMap;

use super::{
    CsRegisters, Csr, CsrId, Effect, Flush, Gate, HypervisorIds, Ids, Kind, SupervisorIds, View,
    Warl,
};
use crate::config::Config;
use crate::core::control::{self, COUNTEREN_MASK, HEDELEG_MASK, MCOUNTINHIBIT_MASK};
use crate::core::csr::{self, CsrSpecifier};
use crate::core::interrupts::{
    mip, standard_interrupts, HYPERVISOR_INTERRUPTS, VIRTUAL_SUPERVISOR_INTERRUPTS,
};
use crate::core::{debug as dbg, envcfg, status, triggers};
use crate::Xlen;

struct Builder<'c> {
    config: &'c Config,
    csrs: Vec<Csr>,
    map: IntMap<CsrSpecifier, CsrId>,
}

impl<'c> Builder<'c> {
    /// Allocates an instance that has no address-map entry.
    fn hidden(&mut self, address: CsrSpecifier, kind: Kind) -> CsrId {
        let id = CsrId(self.csrs.len() as u16);
        self.csrs.push(Csr::new(address, kind));
        id
    }

    fn add(&mut self, address: CsrSpecifier, kind: Kind) -> CsrId {
        let id = self.hidden(address, kind);
        self.map.insert(address, id);
        id
    }

    /// Adds a register with 64-bit storage. On RV32 the storage is hidden and reached through
    /// `address` (low half) and `address_h` (high half).
    fn wide(&mut self, address: CsrSpecifier, address_h: CsrSpecifier, kind: Kind) -> CsrId {
        match self.config.xlen {
            Xlen::Rv64 => self.add(address, kind),
            Xlen::Rv32 => {
                let id = self.hidden(address, kind);
                self.add(address, Kind::proxy(id, View::Low));
                self.add(address_h, Kind::proxy(id, View::High));
                id
            }
        }
    }

    /// Adds the user-level view of counter `index`, backed by `target`.
    fn counter_view(
        &mut self,
        address: CsrSpecifier,
        address_h: CsrSpecifier,
        target: CsrId,
        index: u8,
    ) {
        let views: &[(CsrSpecifier, View)] = match self.config.xlen {
            Xlen::Rv64 => &[(address, View::Full)],
            Xlen::Rv32 => &[(address, View::Low), (address_h, View::High)],
        };
        for (address, view) in views.iter().cloned() {
            let id = self.add(address, Kind::proxy(target, view));
            self.gate(id, Gate::Counter(index));
        }
    }

    /// Adds a register that, with the hypervisor extension, is shadowed by `shadow` while V=1.
    /// Returns the host instance and the mapped instance.
    fn shadowed(
        &mut self,
        address: CsrSpecifier,
        host: Kind,
        shadow: Option<CsrId>,
    ) -> (CsrId, CsrId) {
        match shadow {
            None => {
                let id = self.add(address, host);
                (id, id)
            }
            Some(shadow) => {
                let original = self.hidden(address, host);
                let top = self.add(address, Kind::Virtualized { original, shadow });
                (original, top)
            }
        }
    }

    fn gate(&mut self, id: CsrId, gate: Gate) {
        self.csrs[id.index()].gate = Some(gate);
    }

    fn flush(&mut self, id: CsrId, flush: Flush) {
        self.csrs[id.index()].flush = flush;
    }

    fn effect(&mut self, id: CsrId, effect: Effect) {
        self.csrs[id.index()].effect = effect;
    }
}

fn misa(config: &Config) -> u64 {
    let ext = &config.extensions;
    let letters = [
        (true, 'I'),
        (ext.user, 'U'),
        (ext.supervisor, 'S'),
        (ext.hypervisor, 'H'),
        (ext.float, 'F'),
        (ext.float, 'D'),
        (ext.compressed, 'C'),
    ];
    let bits = letters
        .iter()
        .filter(|(present, _)| *present)
        .fold(0, |acc, (_, letter)| acc | 1 << (*letter as u8 - b'A'));
    config.xlen.encoding() << (config.xlen.bits() - 2) | bits
}

pub(super) fn build(config: &Config) -> CsRegisters {
    let ext = config.extensions;
    let xlen = config.xlen;
    let xmask = xlen.mask();
    let mut b = Builder {
        config,
        csrs: Vec::new(),
        map: IntMap::default(),
    };

    // Machine information registers.
    b.add(csr::MISA, Kind::constant(misa(config)));
    b.add(csr::MVENDORID, Kind::constant(config.vendor_id));
    b.add(csr::MARCHID, Kind::constant(config.arch_id));
    b.add(csr::MIMPID, Kind::constant(config.impl_id));
    b.add(csr::MHARTID, Kind::constant(config.hart_id));
    b.add(csr::MCONFIGPTR, Kind::constant(0));

    // Machine trap setup and handling.
    let mstatus = b.wide(
        csr::MSTATUS,
        csr::MSTATUSH,
        Kind::warl(
            status::mstatus_reset(&ext, xlen),
            status::mstatus_write_mask(&ext),
            Warl::Mstatus,
        ),
    );
    b.flush(mstatus, Flush::OnChange(status::TRANSLATION_FIELDS));

    let (medeleg, mideleg) = match ext.supervisor {
        true => {
            let medeleg = b.add(
                csr::MEDELEG,
                Kind::masked(0, control::medeleg_mask(&ext)),
            );
            let mideleg = b.add(
                csr::MIDELEG,
                Kind::warl(0, config.delegable_interrupts, Warl::Mideleg),
            );
            (Some(medeleg), Some(mideleg))
        }
        false => (None, None),
    };

    let interrupts = standard_interrupts(&ext) | config.custom_interrupts;
    let mie = b.add(csr::MIE, Kind::masked(0, interrupts));
    let mut mip_mask = 0;
    if ext.supervisor {
        mip_mask |= mip::SSIP | mip::STIP | mip::SEIP;
    }
    if ext.hypervisor {
        mip_mask |= mip::VSSIP;
    }
    let mip = b.add(csr::MIP, Kind::warl(0, mip_mask, Warl::Mip));
    let mtvec = b.add(csr::MTVEC, Kind::warl(0, xmask, Warl::Tvec));
    let mcounteren = ext
        .user
        .then(|| b.add(csr::MCOUNTEREN, Kind::masked(COUNTEREN_MASK, COUNTEREN_MASK)));
    let mcountinhibit = b.add(csr::MCOUNTINHIBIT, Kind::masked(0, MCOUNTINHIBIT_MASK));
    b.add(csr::MSCRATCH, Kind::basic(0));
    let mepc = b.add(csr::MEPC, Kind::warl(0, xmask, Warl::Epc));
    let mcause = b.add(csr::MCAUSE, Kind::basic(0));
    let mtval = b.add(csr::MTVAL, Kind::basic(0));

    // Machine configuration.
    let menvcfg = ext.user.then(|| {
        let id = b.wide(
            csr::MENVCFG,
            csr::MENVCFGH,
            Kind::masked(0, envcfg::menvcfg_mask(&ext)),
        );
        b.flush(id, Flush::Always);
        id
    });
    let mseccfg = b.wide(
        csr::MSECCFG,
        csr::MSECCFGH,
        Kind::warl(0, 0b111, Warl::Mseccfg),
    );
    b.gate(mseccfg, Gate::Mseccfg);
    b.flush(mseccfg, Flush::Always);
    b.effect(mseccfg, Effect::Pmp);

    // Physical memory protection.
    let per_register = xlen.bits() as usize / 8;
    let step = match xlen {
        Xlen::Rv32 => 1,
        Xlen::Rv64 => 2,
    };
    let pmpcfg: Vec<CsrId> = (0..16)
        .step_by(step)
        .map(|n| {
            let first = (n / step * per_register) as u8;
            let id = b.add(
                csr::pmpcfg(n as u16),
                Kind::warl(0, xmask, Warl::PmpCfg { first }),
            );
            b.gate(id, Gate::Pmp);
            b.flush(id, Flush::Always);
            b.effect(id, Effect::Pmp);
            id
        })
        .collect();
    let addr_mask = ((1 << (config.physical_address_bits - 2)) - 1) & xmask;
    let pmpaddr: Vec<CsrId> = (0..64)
        .map(|index| {
            let kind = match index < config.pmp_entries {
                true => Kind::warl(0, addr_mask, Warl::PmpAddr { index: index as u8 }),
                false => Kind::constant(0),
            };
            let id = b.add(csr::pmpaddr(index as u16), kind);
            b.gate(id, Gate::Pmp);
            b.flush(id, Flush::Always);
            b.effect(id, Effect::Pmp);
            id
        })
        .collect();

    // Counters and timers.
    let mcycle = b.wide(csr::MCYCLE, csr::MCYCLEH, Kind::counter());
    let minstret = b.wide(csr::MINSTRET, csr::MINSTRETH, Kind::counter());
    let time = b.wide(csr::TIME, csr::TIMEH, Kind::basic(0));
    b.gate(time, Gate::Counter(control::counter_idx::TM as u8));
    b.counter_view(csr::CYCLE, csr::CYCLEH, mcycle, control::counter_idx::CY as u8);
    b.counter_view(
        csr::INSTRET,
        csr::INSTRETH,
        minstret,
        control::counter_idx::IR as u8,
    );
    for n in 3..32u16 {
        let counter = b.wide(
            csr::mhpmcounter(n),
            csr::mhpmcounterh(n),
            Kind::constant(0),
        );
        b.add(csr::mhpmevent(n), Kind::constant(0));
        b.counter_view(csr::hpmcounter(n), csr::hpmcounterh(n), counter, n as u8);
    }

    // Hypervisor registers that S-level registers refer to come first.
    let hypervisor = ext.hypervisor.then(|| {
        let vsstatus = b.add(
            csr::VSSTATUS,
            Kind::warl(
                status::vsstatus_reset(xlen),
                status::sstatus_write_mask(&ext),
                Warl::Vsstatus,
            ),
        );
        b.flush(vsstatus, Flush::OnChange(status::TRANSLATION_FIELDS));
        let hideleg = b.add(
            csr::HIDELEG,
            Kind::warl(0, VIRTUAL_SUPERVISOR_INTERRUPTS, Warl::Hideleg),
        );
        let vs_view = |write| View::Interrupt {
            read: VIRTUAL_SUPERVISOR_INTERRUPTS,
            write,
            deleg: Some(hideleg),
            shift: 1,
        };
        let vsie = b.add(
            csr::VSIE,
            Kind::proxy(mie, vs_view(VIRTUAL_SUPERVISOR_INTERRUPTS)),
        );
        let vsip = b.add(csr::VSIP, Kind::proxy(mip, vs_view(mip::VSSIP)));
        let vstvec = b.add(csr::VSTVEC, Kind::warl(0, xmask, Warl::Tvec));
        let vsscratch = b.add(csr::VSSCRATCH, Kind::basic(0));
        let vsepc = b.add(csr::VSEPC, Kind::warl(0, xmask, Warl::Epc));
        let vscause = b.add(csr::VSCAUSE, Kind::basic(0));
        let vstval = b.add(csr::VSTVAL, Kind::basic(0));
        let vsatp = b.add(csr::VSATP, Kind::warl(0, xmask, Warl::Satp));
        b.flush(vsatp, Flush::Always);

        let hstatus = b.add(
            csr::HSTATUS,
            Kind::masked(
                status::hstatus_reset(xlen),
                status::HSTATUS_WRITE_MASK & xmask,
            ),
        );
        b.flush(hstatus, Flush::Always);
        let hedeleg = b.add(csr::HEDELEG, Kind::masked(0, HEDELEG_MASK));
        let hs_view = |write| View::Interrupt {
            read: HYPERVISOR_INTERRUPTS,
            write,
            deleg: None,
            shift: 0,
        };
        b.add(csr::HIE, Kind::proxy(mie, hs_view(HYPERVISOR_INTERRUPTS)));
        b.add(csr::HIP, Kind::proxy(mip, hs_view(mip::VSSIP)));
        b.add(
            csr::HVIP,
            Kind::proxy(
                mip,
                View::Masked {
                    read: VIRTUAL_SUPERVISOR_INTERRUPTS,
                    write: VIRTUAL_SUPERVISOR_INTERRUPTS,
                },
            ),
        );
        let hcounteren = b.add(
            csr::HCOUNTEREN,
            Kind::masked(COUNTEREN_MASK, COUNTEREN_MASK),
        );
        b.add(csr::HGEIE, Kind::constant(0));
        b.add(csr::HGEIP, Kind::constant(0));
        let htval = b.add(csr::HTVAL, Kind::basic(0));
        let htinst = b.add(csr::HTINST, Kind::basic(0));
        let hgatp = b.add(csr::HGATP, Kind::warl(0, xmask, Warl::Hgatp));
        b.gate(hgatp, Gate::Hgatp);
        b.flush(hgatp, Flush::Always);
        let henvcfg = b.wide(
            csr::HENVCFG,
            csr::HENVCFGH,
            Kind::warl(0, envcfg::henvcfg_mask(&ext), Warl::Henvcfg),
        );
        b.flush(henvcfg, Flush::Always);
        let mtval2 = b.add(csr::MTVAL2, Kind::basic(0));
        let mtinst = b.add(csr::MTINST, Kind::basic(0));

        let ids = HypervisorIds {
            hstatus,
            hedeleg,
            hideleg,
            hcounteren,
            htval,
            htinst,
            hgatp,
            henvcfg,
            mtval2,
            mtinst,
            vsstatus,
            vstvec,
            vsepc,
            vscause,
            vstval,
            vsatp,
        };
        let shadows = [vsie, vsip, vsscratch];
        (ids, shadows)
    });
    let shadow = |pick: fn(&HypervisorIds, &[CsrId; 3]) -> CsrId| {
        hypervisor.as_ref().map(|(ids, shadows)| pick(ids, shadows))
    };

    // Supervisor registers.
    let mut scounteren = None;
    let supervisor = ext.supervisor.then(|| {
        let s_interrupts = interrupts & !HYPERVISOR_INTERRUPTS;
        b.shadowed(
            csr::SSTATUS,
            Kind::proxy(
                mstatus,
                View::Masked {
                    read: status::sstatus_read_mask(xlen),
                    write: status::sstatus_write_mask(&ext),
                },
            ),
            shadow(|h, _| h.vsstatus),
        );
        b.shadowed(
            csr::SIE,
            Kind::proxy(
                mie,
                View::Interrupt {
                    read: s_interrupts,
                    write: s_interrupts,
                    deleg: mideleg,
                    shift: 0,
                },
            ),
            shadow(|_, s| s[0]),
        );
        b.shadowed(
            csr::SIP,
            Kind::proxy(
                mip,
                View::Interrupt {
                    read: s_interrupts,
                    write: mip::SSIP,
                    deleg: mideleg,
                    shift: 0,
                },
            ),
            shadow(|_, s| s[1]),
        );
        let (stvec, _) = b.shadowed(
            csr::STVEC,
            Kind::warl(0, xmask, Warl::Tvec),
            shadow(|h, _| h.vstvec),
        );
        b.shadowed(csr::SSCRATCH, Kind::basic(0), shadow(|_, s| s[2]));
        let (sepc, _) = b.shadowed(
            csr::SEPC,
            Kind::warl(0, xmask, Warl::Epc),
            shadow(|h, _| h.vsepc),
        );
        let (scause, _) = b.shadowed(csr::SCAUSE, Kind::basic(0), shadow(|h, _| h.vscause));
        let (stval, _) = b.shadowed(csr::STVAL, Kind::basic(0), shadow(|h, _| h.vstval));
        let (satp, satp_top) = b.shadowed(
            csr::SATP,
            Kind::warl(0, xmask, Warl::Satp),
            shadow(|h, _| h.vsatp),
        );
        b.flush(satp, Flush::Always);
        b.gate(satp_top, Gate::Satp);

        scounteren = Some(b.add(
            csr::SCOUNTEREN,
            Kind::masked(COUNTEREN_MASK, COUNTEREN_MASK),
        ));
        b.add(csr::SENVCFG, Kind::masked(0, envcfg::SENVCFG_MASK));

        SupervisorIds {
            stvec,
            sepc,
            scause,
            stval,
            satp,
        }
    });

    // Triggers.
    let count = config.triggers;
    let (tdata1, tdata2) = match count {
        0 => {
            for address in [csr::TSELECT, csr::TDATA1, csr::TDATA2, csr::TDATA3] {
                b.add(address, Kind::constant(0));
            }
            b.add(csr::TINFO, Kind::constant(1));
            (Vec::new(), Vec::new())
        }
        _ => {
            let tselect = b.add(
                csr::TSELECT,
                Kind::warl(0, xmask, Warl::Tselect { count: count as u8 }),
            );
            let mut tdata1 = Vec::with_capacity(count);
            let mut tdata2 = Vec::with_capacity(count);
            for _ in 0..count {
                let data1 = b.hidden(
                    csr::TDATA1,
                    Kind::warl(triggers::mcontrol_reset(xlen), xmask, Warl::Mcontrol),
                );
                let data2 = b.hidden(csr::TDATA2, Kind::basic(0));
                for id in [data1, data2] {
                    b.flush(id, Flush::Always);
                    b.effect(id, Effect::Triggers);
                }
                tdata1.push(data1);
                tdata2.push(data2);
            }
            b.add(
                csr::TDATA1,
                Kind::proxy(
                    tselect,
                    View::Indexed {
                        select: tselect,
                        targets: tdata1.clone().into_boxed_slice(),
                        guards: tdata1.clone().into_boxed_slice(),
                    },
                ),
            );
            b.add(
                csr::TDATA2,
                Kind::proxy(
                    tselect,
                    View::Indexed {
                        select: tselect,
                        targets: tdata2.clone().into_boxed_slice(),
                        guards: tdata1.clone().into_boxed_slice(),
                    },
                ),
            );
            b.add(csr::TDATA3, Kind::constant(0));
            b.add(csr::TINFO, Kind::constant(triggers::TINFO));
            (tdata1, tdata2)
        }
    };

    // Debug mode.
    let dcsr = b.add(
        csr::DCSR,
        Kind::warl(dbg::dcsr_reset(), dbg::dcsr_mask(&ext), Warl::Dcsr),
    );
    let dpc = b.add(csr::DPC, Kind::warl(0, xmask, Warl::Epc));
    let dscratch0 = b.add(csr::DSCRATCH0, Kind::basic(0));
    let dscratch1 = b.add(csr::DSCRATCH1, Kind::basic(0));
    for id in [dcsr, dpc, dscratch0, dscratch1] {
        b.gate(id, Gate::DebugOnly);
    }

    // Floating-point state.
    let float = ext.float.then(|| {
        let fflags = b.add(csr::FFLAGS, Kind::masked(0, 0x1F));
        let frm = b.add(csr::FRM, Kind::masked(0, 0b111));
        let fcsr = b.add(
            csr::FCSR,
            Kind::Composite {
                upper: frm,
                lower: fflags,
                upper_lsb: 5,
            },
        );
        for id in [fflags, frm, fcsr] {
            b.gate(id, Gate::Float);
        }
        fflags
    });

    let ids = Ids {
        mstatus,
        mtvec,
        mie,
        mip,
        mepc,
        mcause,
        mtval,
        mcountinhibit,
        mcycle,
        minstret,
        time,
        mseccfg,
        pmpcfg,
        pmpaddr,
        dcsr,
        dpc,
        mcounteren,
        menvcfg,
        medeleg,
        mideleg,
        scounteren,
        supervisor,
        hypervisor: hypervisor.map(|(ids, _)| ids),
        tdata1,
        tdata2,
        float,
    };
    debug!(
        "Built {} CSR instances ({} addresses) for {}",
        b.csrs.len(),
        b.map.len(),
        xlen
    );
    CsRegisters {
        csrs: b.csrs,
        map: b.map,
        config: config.clone(),
        external_seip: false,
        ids,
    }
}
