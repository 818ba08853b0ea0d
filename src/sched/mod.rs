/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! A preemptible round-robin task scheduler over a fixed-size task table.
//!
//! The reference implementation links tasks together with `Task*` prev/next pointers; here
//! the table is a plain array and the circular list is threaded through `Option<usize>`
//! indices into it instead, since a handful of raw pointers into a `static mut` array is
//! exactly the kind of thing Rust's aliasing rules make needlessly painful to get right,
//! and an index is just as cheap.

pub mod context;

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::alloc::{alloc, dealloc, Layout};

use crate::{
	arch::x86::{idt, idt::InterruptFrame, io, pit},
	sync::IntSpin,
};

const MAX_TASKS: usize = crate::build_cfg!(max_tasks);
const TASK_STACK_SIZE: usize = 4096;
const STACK_ALIGN: usize = 16;
const DEFAULT_TIME_SLICE: u32 = 10;
/// IRQ0, the PIT channel used to drive preemption.
const TIMER_VECTOR: u8 = idt::pic::IRQ_BASE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
	Ready,
	Running,
	Blocked,
	Sleeping,
	Zombie,
	Dead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
	Idle = 0,
	Low = 1,
	Normal = 2,
	High = 3,
	Realtime = 4,
}

#[derive(Clone, Copy)]
struct Tcb {
	pid: u32,
	ppid: u32,
	name: [u8; 32],
	state: TaskState,
	priority: Priority,
	time_slice: u32,
	total_time: u32,
	wake_time: u64,
	stack_base: usize,
	esp: u32,
	next: Option<usize>,
	prev: Option<usize>,
	exit_code: i32,
}

impl Tcb {
	const fn dead() -> Self {
		Self {
			pid: 0,
			ppid: 0,
			name: [0; 32],
			state: TaskState::Dead,
			priority: Priority::Normal,
			time_slice: 0,
			total_time: 0,
			wake_time: 0,
			stack_base: 0,
			esp: 0,
			next: None,
			prev: None,
			exit_code: 0,
		}
	}
}

#[derive(Clone, Copy, Default)]
pub struct Stats {
	pub total_tasks: u32,
	pub running_tasks: u32,
	pub ready_tasks: u32,
	pub blocked_tasks: u32,
	pub sleeping_tasks: u32,
	pub context_switches: u32,
}

struct Scheduler {
	tasks: [Tcb; MAX_TASKS],
	task_list: Option<usize>,
	current: Option<usize>,
	next_pid: u32,
	stats: Stats,
}

impl Scheduler {
	const fn new() -> Self {
		Self {
			tasks: [Tcb::dead(); MAX_TASKS],
			task_list: None,
			current: None,
			next_pid: 1,
			stats: Stats {
				total_tasks: 0,
				running_tasks: 0,
				ready_tasks: 0,
				blocked_tasks: 0,
				sleeping_tasks: 0,
				context_switches: 0,
			},
		}
	}

	fn alloc_slot(&self) -> Option<usize> {
		self.tasks.iter().position(|t| t.state == TaskState::Dead)
	}

	fn find_by_pid(&self, pid: u32) -> Option<usize> {
		self.tasks
			.iter()
			.position(|t| t.pid == pid && t.state != TaskState::Dead)
	}

	/// Unlinks `index` from the circular task list and frees its stack. Does not touch
	/// `self.current`; callers that remove the running task must fix that up themselves.
	fn free_task(&mut self, index: usize) {
		let (next, prev) = (self.tasks[index].next, self.tasks[index].prev);
		if next == Some(index) {
			self.task_list = None;
		} else {
			if let Some(next) = next {
				self.tasks[next].prev = prev;
			}
			if let Some(prev) = prev {
				self.tasks[prev].next = next;
			}
			if self.task_list == Some(index) {
				self.task_list = next;
			}
		}

		let stack_base = self.tasks[index].stack_base;
		if stack_base != 0 {
			unsafe {
				dealloc(stack_base as *mut u8, stack_layout());
			}
		}

		self.tasks[index] = Tcb::dead();
		self.stats.total_tasks -= 1;
	}

	fn pick_next(&self) -> Option<usize> {
		let start = match self.current {
			Some(current) => self.tasks[current].next.unwrap_or(current),
			None => self.task_list?,
		};
		let mut index = start;
		loop {
			if self.tasks[index].state == TaskState::Ready {
				return Some(index);
			}
			index = self.tasks[index].next.unwrap_or(index);
			if index == start {
				return None;
			}
		}
	}
}

static SCHEDULER: IntSpin<Scheduler> = IntSpin::new(Scheduler::new());
static TICKS: AtomicU64 = AtomicU64::new(0);

fn stack_layout() -> Layout {
	Layout::from_size_align(TASK_STACK_SIZE, STACK_ALIGN).unwrap()
}

fn write_name(slot: &mut [u8; 32], name: &str) {
	let bytes = name.as_bytes();
	let len = bytes.len().min(31);
	slot[..len].copy_from_slice(&bytes[..len]);
	slot[len] = 0;
}

/// Sets up the fixed task table, registers task 0 (this thread, already running) as the
/// kernel task, wires IRQ0 to [`tick`], and starts the PIT.
pub fn init() {
	let mut scheduler = SCHEDULER.lock();
	let kernel = &mut scheduler.tasks[0];
	kernel.pid = 0;
	kernel.ppid = 0;
	write_name(&mut kernel.name, "kernel");
	kernel.state = TaskState::Running;
	kernel.priority = Priority::Idle;
	kernel.time_slice = DEFAULT_TIME_SLICE;
	kernel.next = Some(0);
	kernel.prev = Some(0);

	scheduler.task_list = Some(0);
	scheduler.current = Some(0);
	scheduler.stats.total_tasks = 1;
	scheduler.stats.running_tasks = 1;
	drop(scheduler);

	idt::register_handler(TIMER_VECTOR, timer_isr);
	idt::pic::enable_irq(0);
	pit::init(crate::build_cfg!(timer_hz));
}

fn timer_isr(_frame: &InterruptFrame) {
	tick();
}

/// Allocates a task slot and stack, and links it into the ready list right after the
/// currently running task. Returns the new task's PID, or `None` if the table or heap is
/// exhausted.
pub fn create(name: &str, entry: extern "C" fn(), priority: Priority) -> Option<u32> {
	let stack_base = unsafe { alloc(stack_layout()) };
	if stack_base.is_null() {
		return None;
	}

	let mut scheduler = SCHEDULER.lock();
	let Some(index) = scheduler.alloc_slot() else {
		drop(scheduler);
		unsafe {
			dealloc(stack_base, stack_layout());
		}
		return None;
	};

	let stack_top = unsafe { stack_base.add(TASK_STACK_SIZE) } as *mut u32;
	let esp = unsafe { context::build_initial_stack(stack_top, entry) };

	let pid = scheduler.next_pid;
	scheduler.next_pid += 1;
	let ppid = scheduler.current.map(|c| scheduler.tasks[c].pid).unwrap_or(0);

	let task = &mut scheduler.tasks[index];
	task.pid = pid;
	task.ppid = ppid;
	write_name(&mut task.name, name);
	task.state = TaskState::Ready;
	task.priority = priority;
	task.time_slice = DEFAULT_TIME_SLICE;
	task.total_time = 0;
	task.wake_time = 0;
	task.stack_base = stack_base as usize;
	task.esp = esp;
	task.exit_code = 0;

	match scheduler.task_list {
		Some(head) => {
			let tail = scheduler.tasks[head].prev.unwrap_or(head);
			task.next = Some(head);
			task.prev = Some(tail);
			scheduler.tasks[tail].next = Some(index);
			scheduler.tasks[head].prev = Some(index);
		}
		None => {
			task.next = Some(index);
			task.prev = Some(index);
			scheduler.task_list = Some(index);
		}
	}

	scheduler.stats.total_tasks += 1;
	scheduler.stats.ready_tasks += 1;
	Some(pid)
}

/// Marks the running task a zombie and switches away. Never returns; task 0 (the kernel
/// task) cannot exit and calling this from it is a no-op.
pub fn exit(exit_code: i32) -> ! {
	{
		let mut scheduler = SCHEDULER.lock();
		if let Some(current) = scheduler.current {
			if current != 0 {
				scheduler.tasks[current].exit_code = exit_code;
				scheduler.tasks[current].state = TaskState::Zombie;
				scheduler.stats.running_tasks -= 1;
			}
		}
	}
	schedule();
	loop {
		io::halt();
	}
}

/// Terminates `pid`. Task 0 can't be killed. Killing the running task behaves like
/// [`exit`]; killing any other task frees its slot immediately.
pub fn kill(pid: u32) -> bool {
	if pid == 0 {
		return false;
	}
	let mut scheduler = SCHEDULER.lock();
	let Some(index) = scheduler.find_by_pid(pid) else {
		return false;
	};

	match scheduler.tasks[index].state {
		TaskState::Running => scheduler.stats.running_tasks -= 1,
		TaskState::Ready => scheduler.stats.ready_tasks -= 1,
		TaskState::Blocked => scheduler.stats.blocked_tasks -= 1,
		TaskState::Sleeping => scheduler.stats.sleeping_tasks -= 1,
		_ => {}
	}

	if scheduler.current == Some(index) {
		scheduler.tasks[index].state = TaskState::Zombie;
		drop(scheduler);
		schedule();
	} else {
		scheduler.free_task(index);
	}
	true
}

pub fn current_pid() -> u32 {
	let scheduler = SCHEDULER.lock();
	scheduler.current.map(|c| scheduler.tasks[c].pid).unwrap_or(0)
}

/// Blocks the running task (e.g. waiting on I/O) and switches away.
pub fn block() {
	let mut scheduler = SCHEDULER.lock();
	let Some(current) = scheduler.current else {
		return;
	};
	scheduler.tasks[current].state = TaskState::Blocked;
	scheduler.stats.running_tasks -= 1;
	scheduler.stats.blocked_tasks += 1;
	drop(scheduler);
	schedule();
}

/// Moves a blocked task back to ready. A no-op for any task not currently blocked.
pub fn unblock(pid: u32) {
	let mut scheduler = SCHEDULER.lock();
	if let Some(index) = scheduler.find_by_pid(pid) {
		if scheduler.tasks[index].state == TaskState::Blocked {
			scheduler.tasks[index].state = TaskState::Ready;
			scheduler.tasks[index].time_slice = DEFAULT_TIME_SLICE;
			scheduler.stats.blocked_tasks -= 1;
			scheduler.stats.ready_tasks += 1;
		}
	}
}

/// Puts the running task to sleep for at least `ms` milliseconds (rounded up to whole
/// ticks at the configured timer frequency) and switches away.
pub fn sleep(ms: u32) {
	let mut scheduler = SCHEDULER.lock();
	let Some(current) = scheduler.current else {
		return;
	};
	const TIMER_HZ: u64 = crate::build_cfg!(timer_hz) as u64;
	let ticks = ((ms as u64 * TIMER_HZ) / 1000).max(1);
	scheduler.tasks[current].wake_time = TICKS.load(Ordering::Relaxed) + ticks;
	scheduler.tasks[current].state = TaskState::Sleeping;
	scheduler.stats.running_tasks -= 1;
	scheduler.stats.sleeping_tasks += 1;
	drop(scheduler);
	schedule();
}

/// Cooperatively gives up the remainder of the running task's time slice.
pub fn yield_now() {
	let mut scheduler = SCHEDULER.lock();
	if let Some(current) = scheduler.current {
		scheduler.tasks[current].time_slice = 0;
	}
	drop(scheduler);
	schedule();
}

pub fn stats() -> Stats {
	SCHEDULER.lock().stats
}

/// Called from the timer ISR: accounts CPU time, promotes sleepers whose wake time has
/// arrived, and preempts the running task once its slice is spent.
pub fn tick() {
	let ticks = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
	let mut scheduler = SCHEDULER.lock();
	let Some(current) = scheduler.current else {
		return;
	};

	scheduler.tasks[current].total_time += 1;
	if scheduler.tasks[current].time_slice > 0 {
		scheduler.tasks[current].time_slice -= 1;
	}

	for i in 0..MAX_TASKS {
		if scheduler.tasks[i].state == TaskState::Sleeping && ticks >= scheduler.tasks[i].wake_time {
			scheduler.tasks[i].state = TaskState::Ready;
			scheduler.tasks[i].time_slice = DEFAULT_TIME_SLICE;
			scheduler.stats.sleeping_tasks -= 1;
			scheduler.stats.ready_tasks += 1;
		}
	}

	let should_switch = scheduler.tasks[current].time_slice == 0;
	drop(scheduler);
	if should_switch {
		schedule();
	}
}

/// Picks the next ready task (round-robin from the one after the current) and performs
/// the actual context switch. A no-op if the running task is still the best candidate.
pub fn schedule() {
	let mut scheduler = SCHEDULER.lock();
	let Some(current) = scheduler.current else {
		return;
	};

	for i in 0..MAX_TASKS {
		if scheduler.tasks[i].state == TaskState::Zombie && i != current {
			scheduler.free_task(i);
		}
	}

	let next = scheduler.pick_next().unwrap_or(0);

	if next == current && scheduler.tasks[current].state == TaskState::Running {
		scheduler.tasks[current].time_slice = DEFAULT_TIME_SLICE;
		return;
	}

	if scheduler.tasks[current].state == TaskState::Running {
		scheduler.tasks[current].state = TaskState::Ready;
		scheduler.stats.running_tasks -= 1;
		scheduler.stats.ready_tasks += 1;
	}

	if scheduler.tasks[next].state == TaskState::Ready {
		scheduler.stats.ready_tasks -= 1;
	}
	scheduler.tasks[next].state = TaskState::Running;
	scheduler.tasks[next].time_slice = DEFAULT_TIME_SLICE;
	scheduler.stats.running_tasks += 1;
	scheduler.stats.context_switches += 1;
	scheduler.current = Some(next);

	if next != current {
		let old_esp_slot = &mut scheduler.tasks[current].esp as *mut u32;
		let new_esp = scheduler.tasks[next].esp;
		// `scheduler` deliberately stays locked (and interrupts disabled) across the
		// switch instead of being dropped first: whoever resumes execution on the other
		// side is responsible for releasing it exactly once. For `current`, resuming
		// later means returning from this very call, where the guard's normal `Drop`
		// does it. For a task running for the first time, that's `task_trampoline`,
		// which never returns here and calls `Spin::force_unlock` itself.
		unsafe {
			context::switch_context(old_esp_slot, new_esp);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	// These exercise `Scheduler`'s pure list/state logic directly rather than through the
	// shared `SCHEDULER` static and real stack allocation, for the same reason `pmm`'s and
	// `heap`'s tests build local instances: a global task table mutated from parallel test
	// threads would race.

	fn link_two(scheduler: &mut Scheduler) -> (usize, usize) {
		scheduler.tasks[0].state = TaskState::Running;
		scheduler.tasks[0].next = Some(1);
		scheduler.tasks[0].prev = Some(1);
		scheduler.tasks[1].state = TaskState::Ready;
		scheduler.tasks[1].pid = 7;
		scheduler.tasks[1].next = Some(0);
		scheduler.tasks[1].prev = Some(0);
		scheduler.task_list = Some(0);
		scheduler.current = Some(0);
		(0, 1)
	}

	#[test]
	fn pick_next_finds_ready_task_after_current() {
		let mut scheduler = Scheduler::new();
		let (_, ready) = link_two(&mut scheduler);
		assert_eq!(scheduler.pick_next(), Some(ready));
	}

	#[test]
	fn pick_next_returns_none_when_nothing_ready() {
		let mut scheduler = Scheduler::new();
		link_two(&mut scheduler);
		scheduler.tasks[1].state = TaskState::Blocked;
		assert_eq!(scheduler.pick_next(), None);
	}

	#[test]
	fn free_task_collapses_single_element_list() {
		let mut scheduler = Scheduler::new();
		scheduler.tasks[0].state = TaskState::Zombie;
		scheduler.tasks[0].next = Some(0);
		scheduler.tasks[0].prev = Some(0);
		scheduler.task_list = Some(0);
		scheduler.stats.total_tasks = 1;
		scheduler.free_task(0);
		assert_eq!(scheduler.task_list, None);
		assert_eq!(scheduler.tasks[0].state, TaskState::Dead);
	}

	#[test]
	fn write_name_truncates_and_null_terminates() {
		let mut name = [0xffu8; 32];
		write_name(&mut name, "a very long task name that does not fit in 31 bytes at all");
		assert_eq!(name[31], 0);
	}
}
