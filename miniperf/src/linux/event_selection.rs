use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

use byteorder::NativeEndian;
use libc::pid_t;
use log::{info, warn};

use miniperf_record::{
    AttrFlags, EventAttr, EventIdRecord, Record, RecordHeader, SampleFormat,
    EVENT_TYPE_USER_SPACE_SAMPLER, RECORD_HEADER_SIZE,
};

use super::environment::{get_online_cpus, get_threads_in_process};
use super::event_fd::{CounterInfo, EventFd};
use super::event_type::{
    create_default_attr, is_supported_by_kernel, parse_event_type, EventTypeAndModifier,
};
use super::io_loop::IOEventLoop;
use super::sys::supported_user_reg_mask;
use crate::error::{Error, Result};

/// One selected event: its parsed name, its attr, and the files opened for
/// it, one per (tid, cpu) pair. Counters of files closed at cpu offline are
/// kept so stat totals stay correct.
pub struct EventSelection {
    pub event_type_modifier: EventTypeAndModifier,
    pub attr: EventAttr,
    pub event_fds: Vec<Rc<RefCell<EventFd>>>,
    pub hotplugged_counters: Vec<CounterInfo>,
}

/// Events in one group share a leader file per (tid, cpu) slot and are
/// scheduled together by the kernel.
pub type EventSelectionGroup = Vec<EventSelection>;

/// Counter snapshots for one selection, for `stat` output.
pub struct CountersInfo {
    pub group_id: usize,
    pub event_name: String,
    pub event_modifier: String,
    pub counters: Vec<CounterInfo>,
}

#[derive(Debug, Clone)]
pub struct EventAttrWithId {
    pub name: String,
    pub attr: EventAttr,
    pub ids: Vec<u64>,
}

pub type RecordCallback = Rc<RefCell<dyn FnMut(Record) -> Result<()>>>;

struct SelectionSetState {
    groups: Vec<EventSelectionGroup>,
    for_stat: bool,
    processes: BTreeSet<pid_t>,
    threads: BTreeSet<pid_t>,
    mmap_pages: usize,
    monitored_cpus: BTreeSet<i32>,
    online_cpus: Vec<i32>,
    record_callback: Option<RecordCallback>,
    io_loop: Option<IOEventLoop>,
    scratch: Rc<RefCell<Vec<u8>>>,
}

/// Groups of event selections, with everything needed to open them across
/// cpus and threads, drain their buffers, and survive cpu hotplug.
///
/// The state sits behind an `Rc<RefCell>` so reactor callbacks (draining,
/// the hotplug scan) can reach back into it while the loop runs.
pub struct EventSelectionSet {
    state: Rc<RefCell<SelectionSetState>>,
}

impl EventSelectionSet {
    pub fn new(for_stat: bool) -> Self {
        EventSelectionSet {
            state: Rc::new(RefCell::new(SelectionSetState {
                groups: Vec::new(),
                for_stat,
                processes: BTreeSet::new(),
                threads: BTreeSet::new(),
                mmap_pages: 0,
                monitored_cpus: BTreeSet::new(),
                online_cpus: Vec::new(),
                record_callback: None,
                io_loop: None,
                scratch: Rc::new(RefCell::new(Vec::new())),
            })),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().groups.is_empty()
    }

    pub fn add_event_type(&self, event_name: &str) -> Result<()> {
        self.add_event_group(std::slice::from_ref(&event_name.to_string()))
    }

    pub fn add_event_group(&self, event_names: &[String]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let mut group = EventSelectionGroup::new();
        for event_name in event_names {
            let selection = state.build_and_check_event_selection(event_name, &group)?;
            group.push(selection);
        }
        let has_user_space_sampler = group
            .iter()
            .any(|s| s.attr.event_type == EVENT_TYPE_USER_SPACE_SAMPLER);
        if has_user_space_sampler {
            if group.len() > 1 {
                return Err(Error::InvalidConfig(
                    "user-space sampler can't be grouped with other events".into(),
                ));
            }
            if state.for_stat {
                return Err(Error::InvalidConfig(
                    "user-space sampler is not supported on the stat command".into(),
                ));
            }
        }
        state.groups.push(group);
        state.union_sample_type();
        Ok(())
    }

    pub fn event_attrs_with_id(&self) -> Vec<EventAttrWithId> {
        let state = self.state.borrow();
        let mut result = Vec::new();
        for group in &state.groups {
            for selection in group {
                result.push(EventAttrWithId {
                    name: selection.event_type_modifier.name.clone(),
                    attr: selection.attr.clone(),
                    ids: selection
                        .event_fds
                        .iter()
                        .map(|fd| fd.borrow().id())
                        .collect(),
                });
            }
        }
        result
    }

    fn for_each_attr(&self, mut f: impl FnMut(&mut EventAttr)) {
        let mut state = self.state.borrow_mut();
        for group in &mut state.groups {
            for selection in group {
                f(&mut selection.attr);
            }
        }
    }

    pub fn set_sample_freq(&self, freq: u64) {
        self.for_each_attr(|attr| {
            attr.flags |= AttrFlags::FREQ;
            attr.sample_period_or_freq = freq;
        });
    }

    pub fn set_sample_period(&self, period: u64) {
        self.for_each_attr(|attr| {
            attr.flags -= AttrFlags::FREQ;
            attr.sample_period_or_freq = period;
        });
    }

    pub fn sample_id_all(&self) {
        self.for_each_attr(|attr| attr.flags |= AttrFlags::SAMPLE_ID_ALL);
    }

    /// Prefer enable-on-exec (with disabled set at open) over a later
    /// enable ioctl; some kernels mishandle the ioctl when it races with
    /// cpu hotplug.
    pub fn set_enable_on_exec(&self, enable: bool) {
        self.for_each_attr(|attr| {
            if enable {
                attr.flags |= AttrFlags::ENABLE_ON_EXEC | AttrFlags::DISABLED;
            } else {
                attr.flags -= AttrFlags::ENABLE_ON_EXEC | AttrFlags::DISABLED;
            }
        });
    }

    pub fn get_enable_on_exec(&self) -> bool {
        let state = self.state.borrow();
        state
            .groups
            .iter()
            .flatten()
            .all(|s| s.attr.flags.contains(AttrFlags::ENABLE_ON_EXEC))
    }

    pub fn enable_fp_callchain_sampling(&self) {
        self.for_each_attr(|attr| attr.sample_type |= SampleFormat::CALLCHAIN);
    }

    pub fn enable_dwarf_callchain_sampling(&self, dump_stack_size: u32) -> Result<()> {
        let reg_mask = supported_user_reg_mask();
        if reg_mask == 0 {
            return Err(Error::InvalidConfig(
                "dwarf callchain sampling is not supported on this architecture".into(),
            ));
        }
        self.for_each_attr(|attr| {
            attr.sample_type |=
                SampleFormat::CALLCHAIN | SampleFormat::REGS_USER | SampleFormat::STACK_USER;
            attr.flags |= AttrFlags::EXCLUDE_CALLCHAIN_USER;
            attr.sample_regs_user = reg_mask;
            attr.sample_stack_user = dump_stack_size;
        });
        Ok(())
    }

    pub fn set_inherit(&self, enable: bool) {
        self.for_each_attr(|attr| {
            if enable {
                attr.flags |= AttrFlags::INHERIT;
            } else {
                attr.flags -= AttrFlags::INHERIT;
            }
        });
    }

    /// Wake the poller on every event instead of at half-full.
    pub fn set_low_watermark(&self) {
        self.for_each_attr(|attr| attr.wakeup_events = 1);
    }

    pub fn need_kernel_symbol(&self) -> bool {
        let state = self.state.borrow();
        state
            .groups
            .iter()
            .flatten()
            .any(|s| !s.event_type_modifier.exclude_kernel)
    }

    pub fn add_monitored_processes(&self, pids: &[pid_t]) {
        self.state.borrow_mut().processes.extend(pids);
    }

    pub fn add_monitored_threads(&self, tids: &[pid_t]) {
        self.state.borrow_mut().threads.extend(tids);
    }

    /// Open files for every (group, tid, cpu) combination. `cpus` may be
    /// empty (use the online set) or `[-1]` (one file over all cpus).
    pub fn open_event_files(&self, cpus: &[i32]) -> Result<()> {
        let mut cpus = cpus.to_vec();
        if !cpus.is_empty() {
            if cpus != [-1] {
                let online = get_online_cpus();
                for cpu in &cpus {
                    if !online.contains(cpu) {
                        return Err(Error::InvalidConfig(format!("cpu {cpu} is not online")));
                    }
                }
            }
        } else {
            cpus = get_online_cpus();
        }
        let mut state = self.state.borrow_mut();
        let threads = state.prepare_threads()?;
        state.open_event_files_for_threads(&threads, &cpus)
    }

    /// Open files stopped; counting starts with an explicit [`enable`] call.
    ///
    /// [`enable`]: EventSelectionSet::enable
    pub fn set_start_disabled(&self) {
        self.for_each_attr(|attr| attr.flags |= AttrFlags::DISABLED);
    }

    pub fn enable(&self) -> Result<()> {
        let state = self.state.borrow();
        for selection in state.groups.iter().flatten() {
            for event_fd in &selection.event_fds {
                event_fd.borrow().enable()?;
            }
        }
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        let state = self.state.borrow();
        for selection in state.groups.iter().flatten() {
            for event_fd in &selection.event_fds {
                event_fd.borrow().disable()?;
            }
        }
        Ok(())
    }

    pub fn read_counters(&self) -> Result<Vec<CountersInfo>> {
        let state = self.state.borrow();
        let mut result = Vec::new();
        for (group_id, group) in state.groups.iter().enumerate() {
            for selection in group {
                let mut counters = selection.hotplugged_counters.clone();
                for event_fd in &selection.event_fds {
                    let event_fd = event_fd.borrow();
                    counters.push(CounterInfo {
                        tid: event_fd.thread_id(),
                        cpu: event_fd.cpu(),
                        counter: event_fd.read_counter()?,
                    });
                }
                result.push(CountersInfo {
                    group_id,
                    event_name: selection.event_type_modifier.event_type.name.clone(),
                    event_modifier: selection.event_type_modifier.modifier.clone(),
                    counters,
                });
            }
        }
        Ok(result)
    }

    /// Map ring buffers, halving the per-cpu size from `max_pages` down to
    /// `min_pages` until the kernel accepts it.
    pub fn mmap_event_files(&self, min_pages: usize, max_pages: usize) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let mut pages = max_pages;
        loop {
            let report_error = pages == min_pages;
            match state.mmap_event_files_with_pages(pages, report_error) {
                Ok(()) => {
                    info!("mapped buffer size is {pages} pages per cpu");
                    state.mmap_pages = pages;
                    return Ok(());
                }
                Err(err) => {
                    state.destroy_mapped_buffers();
                    if pages == min_pages {
                        return Err(err);
                    }
                    pages /= 2;
                }
            }
        }
    }

    /// Register every mapped buffer with the reactor; `callback` receives
    /// each decoded record.
    pub fn prepare_to_read_mmap_event_data(
        &self,
        io_loop: &IOEventLoop,
        callback: RecordCallback,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.record_callback = Some(callback.clone());
        state.io_loop = Some(io_loop.clone());
        let scratch = state.scratch.clone();
        for group in &state.groups {
            for selection in group {
                for event_fd in &selection.event_fds {
                    if event_fd.borrow().has_mapped_buffer() {
                        register_fd_polling(
                            io_loop,
                            event_fd,
                            &selection.attr,
                            &callback,
                            &scratch,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Read each mapped buffer one last time; data below the wakeup
    /// watermark never raised a read event.
    pub fn finish_read_mmap_event_data(&self) -> Result<()> {
        let state = self.state.borrow();
        let callback = match &state.record_callback {
            Some(callback) => callback.clone(),
            None => return Ok(()),
        };
        for group in &state.groups {
            for selection in group {
                for event_fd in &selection.event_fds {
                    if event_fd.borrow().has_mapped_buffer() {
                        read_mmap_event_data_for_fd(
                            event_fd,
                            &selection.attr,
                            &callback,
                            &state.scratch,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Periodically rescan the online cpu set and react to changes. With a
    /// nonempty `monitored_cpus`, only those cpus trigger reactions.
    pub fn handle_cpu_hotplug_events(
        &self,
        io_loop: &IOEventLoop,
        monitored_cpus: &[i32],
        check_interval: Duration,
    ) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            state.monitored_cpus.extend(monitored_cpus);
            state.online_cpus = get_online_cpus();
            state.io_loop = Some(io_loop.clone());
        }
        let state = self.state.clone();
        io_loop.add_periodic_event(check_interval, move || {
            detect_cpu_hotplug_events(&state)
        });
        Ok(())
    }
}

impl SelectionSetState {
    fn build_and_check_event_selection(
        &self,
        event_name: &str,
        pending_group: &[EventSelection],
    ) -> Result<EventSelection> {
        let event_type = parse_event_type(event_name)?;
        if self.for_stat
            && matches!(
                event_type.event_type.name.as_str(),
                "cpu-clock" | "task-clock"
            )
            && (event_type.exclude_user || event_type.exclude_kernel)
        {
            return Err(Error::InvalidConfig(format!(
                "modifiers u and k used in event type {} are not supported by the kernel",
                event_type.event_type.name
            )));
        }
        let mut attr = create_default_attr(&event_type.event_type);
        if event_type.exclude_user {
            attr.flags |= AttrFlags::EXCLUDE_USER;
        }
        if event_type.exclude_kernel {
            attr.flags |= AttrFlags::EXCLUDE_KERNEL;
        }
        if event_type.exclude_hv {
            attr.flags |= AttrFlags::EXCLUDE_HV;
        }
        if event_type.exclude_host {
            attr.flags |= AttrFlags::EXCLUDE_HOST;
        }
        if event_type.exclude_guest {
            attr.flags |= AttrFlags::EXCLUDE_GUEST;
        }
        attr.set_precise_ip(event_type.precise_ip);
        if attr.event_type != EVENT_TYPE_USER_SPACE_SAMPLER && !is_supported_by_kernel(&attr) {
            return Err(Error::InvalidConfig(format!(
                "event type '{}' is not supported by the kernel",
                event_type.name
            )));
        }

        let duplicate = self
            .groups
            .iter()
            .flatten()
            .chain(pending_group.iter())
            .any(|s| s.event_type_modifier.name == event_type.name);
        if duplicate {
            return Err(Error::InvalidConfig(format!(
                "event type '{}' appears more than once",
                event_type.name
            )));
        }
        Ok(EventSelection {
            event_type_modifier: event_type,
            attr,
            event_fds: Vec::new(),
            hotplugged_counters: Vec::new(),
        })
    }

    // Unioning the sample selectors gives every attr the same sample layout,
    // so one attr can decode any record in the stream.
    fn union_sample_type(&mut self) {
        let mut sample_type = SampleFormat::empty();
        for selection in self.groups.iter().flatten() {
            sample_type |= selection.attr.sample_type;
        }
        for selection in self.groups.iter_mut().flatten() {
            selection.attr.sample_type = sample_type;
        }
    }

    fn prepare_threads(&self) -> Result<Vec<pid_t>> {
        let mut threads: BTreeSet<pid_t> = self.threads.clone();
        for &pid in &self.processes {
            match get_threads_in_process(pid) {
                Ok(tids) => threads.extend(tids),
                Err(err) => {
                    return Err(Error::InvalidConfig(format!(
                        "cannot get threads of process {pid}: {err}"
                    )))
                }
            }
        }
        if threads.is_empty() {
            return Err(Error::InvalidConfig("no monitored target".into()));
        }
        Ok(threads.into_iter().collect())
    }

    fn open_event_files_for_threads(&mut self, threads: &[pid_t], cpus: &[i32]) -> Result<()> {
        for group_index in 0..self.groups.len() {
            if self.is_user_space_sampler_group(group_index) {
                return Err(Error::InvalidConfig(
                    "user-space sampler is not supported in this build".into(),
                ));
            }
            for &tid in threads {
                let mut success_cpu_count = 0;
                let mut last_error = None;
                for &cpu in cpus {
                    match open_event_files_on_group(&mut self.groups[group_index], tid, cpu) {
                        Ok(()) => success_cpu_count += 1,
                        Err(err) => last_error = Some(err),
                    }
                }
                // Online cpus change at runtime, so a subset of cpus failing
                // is fine, but every (group, tid) needs at least one.
                if success_cpu_count == 0 {
                    return Err(last_error.unwrap_or_else(|| {
                        Error::InvalidConfig("no cpu to open event files on".into())
                    }));
                }
            }
        }
        Ok(())
    }

    fn is_user_space_sampler_group(&self, group_index: usize) -> bool {
        let group = &self.groups[group_index];
        group.len() == 1 && group[0].attr.event_type == EVENT_TYPE_USER_SPACE_SAMPLER
    }

    fn mmap_event_files_with_pages(&mut self, pages: usize, report_error: bool) -> Result<()> {
        // One buffer per cpu: the first file on a cpu owns the mapping, the
        // rest route their output into it.
        let mut cpu_owners: Vec<(i32, Rc<RefCell<EventFd>>)> = Vec::new();
        for group in &self.groups {
            for selection in group {
                for event_fd in &selection.event_fds {
                    let cpu = event_fd.borrow().cpu();
                    match cpu_owners.iter().find(|(c, _)| *c == cpu) {
                        Some((_, owner)) => {
                            event_fd
                                .borrow()
                                .share_mapped_buffer(&owner.borrow(), report_error)?;
                        }
                        None => {
                            event_fd
                                .borrow_mut()
                                .create_mapped_buffer(pages, report_error)?;
                            cpu_owners.push((cpu, event_fd.clone()));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn destroy_mapped_buffers(&mut self) {
        for selection in self.groups.iter_mut().flatten() {
            for event_fd in &selection.event_fds {
                event_fd.borrow_mut().destroy_mapped_buffer();
            }
        }
    }
}

/// Open every event of one group on a (tid, cpu) slot, leader first. The
/// slot opens all-or-nothing: a failure drops files already opened for it.
fn open_event_files_on_group(
    group: &mut EventSelectionGroup,
    tid: pid_t,
    cpu: i32,
) -> Result<()> {
    let mut opened: Vec<EventFd> = Vec::with_capacity(group.len());
    for selection in group.iter() {
        let leader = opened.first();
        let event_fd = EventFd::open(
            &selection.attr,
            &selection.event_type_modifier.name,
            tid,
            cpu,
            leader,
        )?;
        opened.push(event_fd);
    }
    for (selection, event_fd) in group.iter_mut().zip(opened) {
        selection.event_fds.push(Rc::new(RefCell::new(event_fd)));
    }
    Ok(())
}

fn register_fd_polling(
    io_loop: &IOEventLoop,
    event_fd: &Rc<RefCell<EventFd>>,
    attr: &EventAttr,
    callback: &RecordCallback,
    scratch: &Rc<RefCell<Vec<u8>>>,
) {
    let fd = event_fd.borrow().fd();
    let event_fd_clone = event_fd.clone();
    let attr = attr.clone();
    let callback = callback.clone();
    let scratch = scratch.clone();
    let io_event = io_loop.add_fd_event(fd, move || {
        read_mmap_event_data_for_fd(&event_fd_clone, &attr, &callback, &scratch)
    });
    event_fd.borrow_mut().set_poll_event(io_event);
}

/// Drain one buffer and deliver each decoded record. A record that fails to
/// decode is logged and skipped; the rest of the buffer is still processed.
fn read_mmap_event_data_for_fd(
    event_fd: &Rc<RefCell<EventFd>>,
    attr: &EventAttr,
    callback: &RecordCallback,
    scratch: &Rc<RefCell<Vec<u8>>>,
) -> Result<()> {
    let mut buf = scratch.borrow_mut();
    let size = event_fd.borrow_mut().read_mmap_data(&mut buf);
    if size == 0 {
        return Ok(());
    }
    let mut offset = 0;
    while offset + RECORD_HEADER_SIZE <= size {
        let header = match RecordHeader::parse::<NativeEndian>(&buf[offset..]) {
            Ok(header) => header,
            Err(err) => {
                warn!("bad record header in mapped buffer: {err}");
                break;
            }
        };
        let end = offset + header.size as usize;
        if end > size {
            warn!("record runs past the end of the mapped buffer data");
            break;
        }
        match Record::parse::<NativeEndian>(&buf[offset..end], attr) {
            Ok(record) => (callback.borrow_mut())(record)?,
            Err(err) => warn!("skipping undecodable record of type {}: {err}", header.record_type),
        }
        offset = end;
    }
    Ok(())
}

fn detect_cpu_hotplug_events(state: &Rc<RefCell<SelectionSetState>>) -> Result<()> {
    let new_cpus = get_online_cpus();
    let (gone, added): (Vec<i32>, Vec<i32>) = {
        let state = state.borrow();
        let monitored = |cpu: &i32| {
            state.monitored_cpus.is_empty() || state.monitored_cpus.contains(cpu)
        };
        (
            state
                .online_cpus
                .iter()
                .filter(|cpu| !new_cpus.contains(cpu))
                .filter(|cpu| monitored(cpu))
                .copied()
                .collect(),
            new_cpus
                .iter()
                .filter(|cpu| !state.online_cpus.contains(cpu))
                .filter(|cpu| monitored(cpu))
                .copied()
                .collect(),
        )
    };
    for cpu in gone {
        info!("cpu {cpu} is offlined");
        handle_cpu_offline_event(state, cpu)?;
    }
    for cpu in added {
        info!("cpu {cpu} is onlined");
        handle_cpu_online_event(state, cpu)?;
    }
    state.borrow_mut().online_cpus = new_cpus;
    Ok(())
}

fn handle_cpu_offline_event(state_rc: &Rc<RefCell<SelectionSetState>>, cpu: i32) -> Result<()> {
    let mut state = state_rc.borrow_mut();
    let for_stat = state.for_stat;
    let callback = state.record_callback.clone();
    let scratch = state.scratch.clone();
    for group in &mut state.groups {
        for selection in group {
            let mut kept = Vec::with_capacity(selection.event_fds.len());
            for event_fd in selection.event_fds.drain(..) {
                if event_fd.borrow().cpu() != cpu {
                    kept.push(event_fd);
                    continue;
                }
                if for_stat {
                    // Counter reads of dying files must succeed or the stat
                    // totals are wrong.
                    let fd = event_fd.borrow();
                    selection.hotplugged_counters.push(CounterInfo {
                        tid: fd.thread_id(),
                        cpu: fd.cpu(),
                        counter: fd.read_counter()?,
                    });
                } else if event_fd.borrow().has_mapped_buffer() {
                    if let Some(callback) = &callback {
                        read_mmap_event_data_for_fd(
                            &event_fd,
                            &selection.attr,
                            callback,
                            &scratch,
                        )?;
                    }
                    event_fd.borrow_mut().stop_polling();
                }
                // Dropping the last reference closes the file.
            }
            selection.event_fds = kept;
        }
    }
    Ok(())
}

fn handle_cpu_online_event(state_rc: &Rc<RefCell<SelectionSetState>>, cpu: i32) -> Result<()> {
    let mut state = state_rc.borrow_mut();
    // Profiling is already running, so the new files must start enabled.
    for selection in state.groups.iter_mut().flatten() {
        selection.attr.flags -= AttrFlags::ENABLE_ON_EXEC | AttrFlags::DISABLED;
    }
    let threads = state.prepare_threads()?;
    for group_index in 0..state.groups.len() {
        if state.is_user_space_sampler_group(group_index) {
            continue;
        }
        for &tid in &threads {
            if let Err(err) = open_event_files_on_group(&mut state.groups[group_index], tid, cpu)
            {
                // The cpu may already be offline again.
                warn!("failed to open perf event files for thread {tid} on cpu {cpu}: {err}");
            }
        }
    }
    if state.for_stat {
        return Ok(());
    }

    // Give the new files a buffer and start draining it.
    let pages = state.mmap_pages;
    let mut owner: Option<(Rc<RefCell<EventFd>>, EventAttr)> = None;
    for group in &state.groups {
        for selection in group {
            for event_fd in &selection.event_fds {
                if event_fd.borrow().cpu() != cpu || event_fd.borrow().has_mapped_buffer() {
                    continue;
                }
                match &owner {
                    Some((owner_fd, _)) => {
                        event_fd
                            .borrow()
                            .share_mapped_buffer(&owner_fd.borrow(), true)?;
                    }
                    None => {
                        event_fd.borrow_mut().create_mapped_buffer(pages, true)?;
                        owner = Some((event_fd.clone(), selection.attr.clone()));
                    }
                }
            }
        }
    }
    if let (Some((owner_fd, attr)), Some(io_loop), Some(callback)) =
        (&owner, &state.io_loop, &state.record_callback)
    {
        register_fd_polling(io_loop, owner_fd, attr, callback, &state.scratch);
    }

    // Tell the sink which ids belong to which attr, so records from the new
    // files can be correlated.
    let mut ids = Vec::new();
    let mut attr_id = 0u64;
    for group in &state.groups {
        for selection in group {
            for event_fd in &selection.event_fds {
                if event_fd.borrow().cpu() == cpu {
                    ids.push((attr_id, event_fd.borrow().id()));
                }
            }
            attr_id += 1;
        }
    }
    if let Some(callback) = &state.record_callback {
        if !ids.is_empty() {
            (callback.borrow_mut())(Record::EventId(EventIdRecord { ids }))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Configuration-only tests; software clock events are recognized on
    // every kernel, and support probing treats permission errors as
    // supported, so these run in restricted environments too.

    fn set_with_events(names: &[&str]) -> EventSelectionSet {
        let set = EventSelectionSet::new(false);
        for name in names {
            set.add_event_type(name).unwrap();
        }
        set
    }

    #[test]
    fn duplicate_events_are_rejected() {
        let set = set_with_events(&["cpu-clock"]);
        assert!(set.add_event_type("cpu-clock").is_err());
        assert!(set.add_event_type("cpu-clock:u").is_ok());
    }

    #[test]
    fn stat_rejects_clock_privilege_modifiers() {
        let set = EventSelectionSet::new(true);
        assert!(set.add_event_type("cpu-clock:u").is_err());
        assert!(set.add_event_type("task-clock:k").is_err());
        assert!(set.add_event_type("cpu-clock").is_ok());
    }

    #[test]
    fn union_sample_type_unifies_masks() {
        let set = set_with_events(&["cpu-clock"]);
        set.enable_fp_callchain_sampling();
        set.add_event_type("task-clock").unwrap();
        let attrs = set.event_attrs_with_id();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].attr.sample_type, attrs[1].attr.sample_type);
        assert!(attrs[1].attr.sample_type.contains(SampleFormat::CALLCHAIN));
    }

    #[test]
    fn enable_on_exec_round_trips() {
        let set = set_with_events(&["cpu-clock"]);
        assert!(!set.get_enable_on_exec());
        set.set_enable_on_exec(true);
        assert!(set.get_enable_on_exec());
        set.set_enable_on_exec(false);
        assert!(!set.get_enable_on_exec());
    }

    #[test]
    fn kernel_symbol_need_follows_modifiers() {
        let set = set_with_events(&["cpu-clock:u"]);
        assert!(!set.need_kernel_symbol());
        set.add_event_type("task-clock").unwrap();
        assert!(set.need_kernel_symbol());
    }
}
