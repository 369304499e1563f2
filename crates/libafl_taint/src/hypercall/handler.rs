use log::{debug, info, warn};

use super::{
    HypercallAction, HypercallStruct, TrapArgs, HYPERCALL_STRUCT_SIZE, MAX_INFO_LEN,
    QUERY_HYPERCALL_MAX_LEN,
};
use crate::{
    addr::make_maddr,
    engine::{TaintEngine, TaintState},
    host::TaintHost,
    labels::Label,
    records::{AttackPointRecord, LogEntry, SrcInfo, TaintQueryEntry, TaintQueryRecord},
    GuestReg, GuestVirtAddr,
};

fn src_info(phs: &HypercallStruct) -> SrcInfo {
    SrcInfo {
        filename: phs.src_filename,
        ast_node_name: phs.src_ast_node_name,
        linenum: phs.src_linenum,
        insertion_point: (phs.insertion_point != 0).then_some(phs.insertion_point),
        ast_loc_id: phs.src_filename,
    }
}

/// Reads guest memory, substituting `0` for every byte that cannot be read.
fn read_lossy<H>(host: &H, vaddr: GuestVirtAddr, buf: &mut [u8])
where
    H: TaintHost,
{
    if host.read_virt(vaddr, buf).is_ok() {
        return;
    }
    for (i, byte) in (0..).zip(buf.iter_mut()) {
        *byte = host.read_byte_lossy(vaddr.wrapping_add(i));
    }
}

fn read_c_string<H>(host: &H, vaddr: GuestVirtAddr) -> String
where
    H: TaintHost,
{
    if vaddr == 0 {
        return String::new();
    }
    let bytes: Vec<u8> = (0..MAX_INFO_LEN as u64)
        .map(|i| host.read_byte_lossy(vaddr.wrapping_add(i)))
        .take_while(|c| *c != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

impl TaintEngine {
    /// Services a guest trap.
    ///
    /// Returns `true` if the trap was a taint request. Malformed requests are
    /// logged and dropped, they never touch the taint state.
    pub fn guest_hypercall<H>(&mut self, host: &mut H) -> bool
    where
        H: TaintHost,
    {
        if !matches!(
            self.state,
            TaintState::Enabled | TaintState::DisablePending
        ) {
            return false;
        }
        let args = match host.trap_args() {
            Ok(args) => args,
            Err(err) => {
                warn!("Could not read trap registers: {err}");
                return false;
            }
        };

        if let Some(action) = HypercallAction::from_cmd(args.cmd) {
            self.label_from_regs(host, action, args);
            return true;
        }

        let ptr = args.cmd;
        if host.virt_to_phys(ptr).is_none() {
            debug!("Trap with invalid pointer in command register: vaddr={ptr:#x}. Probably not a taint hypercall");
            return false;
        }
        let mut raw = [0u8; HYPERCALL_STRUCT_SIZE];
        read_lossy(host, ptr, &mut raw);
        let phs = match HypercallStruct::decode(&raw) {
            Ok(phs) => phs,
            Err(err) => {
                warn!("{err}");
                return false;
            }
        };

        match phs.action() {
            Some(HypercallAction::Query) => self.taint_query_hypercall(host, &phs),
            Some(HypercallAction::AttackPoint) => self.attack_point(host, &phs),
            Some(action @ (HypercallAction::LabelSingle | HypercallAction::LabelPositional)) => {
                self.label_buffer(
                    host,
                    action,
                    phs.buf_addr(),
                    GuestReg::from(phs.len),
                    GuestReg::from(phs.label_num),
                );
            }
            Some(HypercallAction::PriQuery | HypercallAction::Exploitability) => {}
            None => debug!("Unknown hypercall action {}", phs.action),
        }
        true
    }

    fn label_from_regs<H>(&mut self, host: &mut H, action: HypercallAction, args: TrapArgs)
    where
        H: TaintHost,
    {
        self.label_buffer(host, action, args.arg1, args.arg2, args.arg3);
    }

    fn label_buffer<H>(
        &mut self,
        host: &mut H,
        action: HypercallAction,
        buf: GuestVirtAddr,
        len: GuestReg,
        label: GuestReg,
    ) where
        H: TaintHost,
    {
        if len == GuestReg::from(super::LEN_NULL_TERMINATED) {
            warn!("Refusing to label a null-terminated buffer at {buf:#x}, an explicit length is required");
            return;
        }
        let Ok(label) = Label::try_from(label) else {
            warn!("Label {label:#x} does not fit a taint label, request dropped");
            return;
        };
        let res = match action {
            HypercallAction::LabelPositional => {
                info!("positional taint label, base {label}, {len:#x} bytes at {buf:#x}");
                self.label_ram_virt_positional(host, buf, len, label)
            }
            _ => {
                info!("single taint label {label}, {len:#x} bytes at {buf:#x}");
                self.label_ram_virt_single(host, buf, len, label)
            }
        };
        match res {
            Ok(labeled) => debug!("labeled {labeled} of {len} byte(s)"),
            Err(err) => warn!("Label request rejected: {err}"),
        }
    }

    fn taint_query_hypercall<H>(&mut self, host: &mut H, phs: &HypercallStruct)
    where
        H: TaintHost,
    {
        if self.sink.is_none() || self.labels_applied.is_empty() {
            return;
        }
        let strnlen = phs.is_null_terminated();
        if !strnlen && phs.len == 0 {
            return;
        }
        let Some(shadow) = self.shadow.as_ref() else {
            return;
        };

        let buf = phs.buf_addr();
        let mut taint_query = Vec::new();
        let mut offset: u32 = 0;
        loop {
            let va = buf + GuestVirtAddr::from(offset);
            if strnlen && host.read_byte_lossy(va) == 0 {
                break;
            }
            if let Some(pa) = host.virt_to_phys(va) {
                let labels = shadow.query(make_maddr(pa));
                if !labels.is_empty() {
                    taint_query.push(TaintQueryEntry {
                        offset,
                        labels: labels.to_vec(),
                    });
                }
            }
            offset += 1;
            if !strnlen && offset == phs.len {
                break;
            }
            if strnlen && offset == QUERY_HYPERCALL_MAX_LEN {
                break;
            }
        }
        if taint_query.is_empty() {
            return;
        }

        let len = offset;
        let data = (0..len.min(QUERY_HYPERCALL_MAX_LEN))
            .map(|i| host.read_byte_lossy(buf + GuestVirtAddr::from(i)))
            .collect();
        let num_tainted = u32::try_from(taint_query.len()).unwrap_or(u32::MAX);
        debug!("taint query at {buf:#x}: {num_tainted} of {len} byte(s) tainted");
        let record = TaintQueryRecord {
            buf,
            len,
            num_tainted,
            data,
            src_info: src_info(phs),
            call_stack: host.call_stack(),
            taint_query,
        };
        self.emit(LogEntry::TaintQuery(record));
    }

    fn attack_point<H>(&mut self, host: &mut H, phs: &HypercallStruct)
    where
        H: TaintHost,
    {
        if self.sink.is_none() {
            return;
        }
        let record = AttackPointRecord {
            info: read_c_string(host, GuestVirtAddr::from(phs.info)),
            src_info: src_info(phs),
            call_stack: host.call_stack(),
        };
        debug!("attack point: {}", record.info);
        self.emit(LogEntry::AttackPoint(record));
    }
}
