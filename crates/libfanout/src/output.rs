use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::memory::{ChildId, MemoryBudget};
use crate::screen::Screen;
use crate::store::{ChunkStore, STDERR_TAG, STDOUT_TAG};
use crate::term;

/// Where a child's bytes currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Bytes append to the in-memory store.
    Buffered,
    /// The scheduler has flushed and freed the store; not every reader has
    /// observed the promotion signal yet.
    PromotedPending,
    /// Every reader observed the promotion; bytes go straight to the
    /// terminal.
    Live,
}

struct OutputState {
    mode: OutputMode,
    store: ChunkStore,
    pending_acks: u32,
}

/// Capture state for one child: the buffered store, the buffered/live mode,
/// and (in interactive mode) the virtual screens that stand between the pty
/// and the store.
///
/// `mode` and `store` live under one mutex; every mode transition happens
/// atomically with respect to appends, which is what keeps bytes produced
/// around the promotion instant in order.
pub struct ChildOutput {
    id: ChildId,
    fd_stream_ends: u32,
    state: Mutex<OutputState>,
    promoted_tx: watch::Sender<bool>,
    memory: Arc<MemoryBudget>,
    screens: [Option<Mutex<Screen>>; 2],
}

impl ChildOutput {
    pub fn new(
        id: ChildId,
        fd_stream_ends: u32,
        screens: [Option<Screen>; 2],
        memory: Arc<MemoryBudget>,
    ) -> Arc<Self> {
        let (promoted_tx, _) = watch::channel(false);
        let [stdout_screen, stderr_screen] = screens;
        Arc::new(Self {
            id,
            fd_stream_ends,
            state: Mutex::new(OutputState {
                mode: OutputMode::Buffered,
                store: ChunkStore::new(),
                pending_acks: 0,
            }),
            promoted_tx,
            memory,
            screens: [stdout_screen.map(Mutex::new), stderr_screen.map(Mutex::new)],
        })
    }

    pub fn id(&self) -> ChildId {
        self.id
    }

    /// How many reader streams must report EOF before the child counts as
    /// drained: 1 when stderr shares stdout's stream, else 2.
    pub fn fd_stream_ends(&self) -> u32 {
        self.fd_stream_ends
    }

    pub fn subscribe_promotion(&self) -> watch::Receiver<bool> {
        self.promoted_tx.subscribe()
    }

    pub fn mode(&self) -> OutputMode {
        self.lock_state().mode
    }

    fn screen_slot(&self, tag: u8) -> &Option<Mutex<Screen>> {
        match tag {
            STDOUT_TAG => &self.screens[0],
            STDERR_TAG => &self.screens[1],
            other => panic!("no stream with fd tag {other}"),
        }
    }

    pub fn has_screen(&self, tag: u8) -> bool {
        self.screen_slot(tag).is_some()
    }

    /// Feeds raw pty bytes into the stream's virtual screen. Interactive
    /// bytes do not reach the store directly; only lines the screen spills
    /// do.
    pub fn advance_screen(&self, tag: u8, bytes: &[u8]) {
        if let Some(screen) = self.screen_slot(tag) {
            screen.lock().expect("screen lock poisoned").advance(bytes);
        }
    }

    /// Ends the stream's screen if it has not been ended yet, and returns
    /// any scrollback waiting to be submitted.
    pub fn finish_screen(&self, tag: u8) -> Option<Vec<u8>> {
        let screen = self.screen_slot(tag).as_ref()?;
        let mut screen = screen.lock().expect("screen lock poisoned");
        if !screen.is_ended() {
            screen.end();
        }
        let scrollback = screen.take_scrollback();
        if scrollback.is_empty() { None } else { Some(scrollback) }
    }

    /// Drains spilled scrollback without ending the screen.
    pub fn take_screen_scrollback(&self, tag: u8) -> Option<Vec<u8>> {
        let screen = self.screen_slot(tag).as_ref()?;
        let mut screen = screen.lock().expect("screen lock poisoned");
        if !screen.has_scrollback() {
            return None;
        }
        Some(screen.take_scrollback())
    }

    pub fn resize_screens(&self, cols: u16, rows: u16) {
        for screen in self.screens.iter().flatten() {
            screen.lock().expect("screen lock poisoned").resize(cols, rows);
        }
    }

    /// Routes bytes according to the reader's locally-observed promotion
    /// state and the child's authoritative mode, applying back-pressure for
    /// anything that may be buffered.
    ///
    /// The disagree row is the promotion race: the scheduler flushed and
    /// freed the store while these bytes were already read. Interactive
    /// streams push them back through the screen so the reader's upcoming
    /// `end()` surfaces them after the flushed tail; pipe streams write them
    /// straight out, which is equivalent because the store was emptied under
    /// this same lock.
    pub async fn submit(&self, reader_promoted: bool, tag: u8, bytes: &[u8]) {
        let delta = ChunkStore::chunk_size_with_header(bytes.len());
        if !reader_promoted {
            self.memory.reserve(self.id, delta).await;
        }

        let mut state = self.lock_state();
        match (reader_promoted, state.mode) {
            (true, OutputMode::PromotedPending | OutputMode::Live) => {
                write_to_parent(tag, bytes);
            }
            (false, OutputMode::Buffered) => {
                state.store.append(tag, bytes);
            }
            (false, OutputMode::PromotedPending | OutputMode::Live) => {
                self.memory.unreserve(delta);
                drop(state);
                if self.has_screen(tag) {
                    self.advance_screen(tag, bytes);
                } else {
                    write_to_parent(tag, bytes);
                }
            }
            (true, OutputMode::Buffered) => {
                panic!("reader observed a promotion the child never went through");
            }
        }
    }

    /// The scheduler's promotion: flush the store to the terminal, free the
    /// slab, return the flushed bytes to the memory budget, install this
    /// child as the foreground, and fire the promotion signal. All under the
    /// mode lock so no append lands between the flush and the mode flip.
    pub fn promote_and_flush(&self) {
        let mut state = self.lock_state();
        assert!(
            state.mode == OutputMode::Buffered,
            "child promoted twice"
        );
        state.store.drain(|tag, payload| write_to_parent(tag, payload));
        let flushed = state.store.len_bytes() as u64;
        state.store.free();
        self.memory.promote_to_foreground(self.id, flushed);
        state.mode = OutputMode::PromotedPending;
        state.pending_acks = self.fd_stream_ends;
        self.promoted_tx.send_replace(true);
    }

    /// A reader's acknowledgement that it observed the promotion signal.
    /// The last acknowledgement completes the transition to `Live`.
    pub fn acknowledge_promotion(&self) {
        let mut state = self.lock_state();
        if state.mode != OutputMode::PromotedPending {
            return;
        }
        state.pending_acks = state.pending_acks.saturating_sub(1);
        if state.pending_acks == 0 {
            state.mode = OutputMode::Live;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().expect("child output lock poisoned")
    }
}

fn parent_fd_for(tag: u8) -> RawFd {
    match tag {
        STDOUT_TAG => term::STDOUT_FD,
        STDERR_TAG => term::STDERR_FD,
        other => panic!("no parent fd for tag {other}"),
    }
}

fn write_to_parent(tag: u8, bytes: &[u8]) {
    if let Err(err) = term::write_all_fd(parent_fd_for(tag), bytes) {
        // Nothing sensible is left to do if the controlling terminal is gone.
        eprintln!("fanout: write to fd {tag} failed: {err}");
        std::process::exit(1);
    }
}
