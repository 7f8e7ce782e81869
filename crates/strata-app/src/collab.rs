//! Console-backed collaborators for the headless binary.

use std::io::{BufRead, BufReader, Stdin, Write};

use strata_config::CorruptChunkPolicy;
use strata_world::{ChunkCoord, CorruptChunkChoice, EntityInstance, LoadingUi, PhysicsSink};
use tracing::{error, info};

// ---------------------------------------------------------------------------
// UI
// ---------------------------------------------------------------------------

/// Loading feedback as log lines. The corrupt-chunk prompt is answered from
/// the configured policy, or read from `input` under [`CorruptChunkPolicy::Ask`].
pub struct ConsoleUi<R> {
    policy: CorruptChunkPolicy,
    input: R,
    loading: bool,
    prompts: u32,
}

/// UI answering prompts from the terminal.
pub type StdinUi = ConsoleUi<BufReader<Stdin>>;

impl StdinUi {
    pub fn stdin(policy: CorruptChunkPolicy) -> Self {
        Self::new(policy, BufReader::new(std::io::stdin()))
    }
}

impl<R: BufRead> ConsoleUi<R> {
    pub fn new(policy: CorruptChunkPolicy, input: R) -> Self {
        Self {
            policy,
            input,
            loading: false,
            prompts: 0,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Corrupt-chunk dialogs shown so far.
    pub fn prompts(&self) -> u32 {
        self.prompts
    }

    fn ask(&mut self, coord: ChunkCoord) -> CorruptChunkChoice {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "chunk {coord} is unreadable. [r]egenerate or [a]bort? ");
        let _ = stderr.flush();

        let mut line = String::new();
        match self.input.read_line(&mut line) {
            // No answer aborts.
            Ok(0) | Err(_) => CorruptChunkChoice::Abort,
            Ok(_) => match line.trim().to_ascii_lowercase().as_str() {
                "r" | "regenerate" => CorruptChunkChoice::Regenerate,
                _ => CorruptChunkChoice::Abort,
            },
        }
    }
}

impl<R: BufRead> LoadingUi for ConsoleUi<R> {
    fn show_loading_screen(&mut self, visible: bool) {
        self.loading = visible;
        if visible {
            info!("loading chunks");
        } else {
            info!("world ready");
        }
    }

    fn show_corrupt_chunk_dialog(&mut self, coord: ChunkCoord) -> CorruptChunkChoice {
        self.prompts += 1;
        let choice = match self.policy {
            CorruptChunkPolicy::Regenerate => CorruptChunkChoice::Regenerate,
            CorruptChunkPolicy::Abort => CorruptChunkChoice::Abort,
            CorruptChunkPolicy::Ask => self.ask(coord),
        };
        error!(%coord, ?choice, "corrupt chunk");
        choice
    }
}

// ---------------------------------------------------------------------------
// Physics
// ---------------------------------------------------------------------------

/// Tracks how many entities are in the simulation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountingPhysics {
    pub active: usize,
    pub added: u64,
    pub removed: u64,
}

impl PhysicsSink for CountingPhysics {
    fn add_entities(&mut self, entities: &[EntityInstance]) {
        self.active += entities.len();
        self.added += entities.len() as u64;
    }

    fn remove_entities(&mut self, entities: &[EntityInstance]) {
        self.active = self.active.saturating_sub(entities.len());
        self.removed += entities.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec2;
    use strata_world::{ObjectId, Torch};

    use super::*;

    fn ui(policy: CorruptChunkPolicy, input: &str) -> ConsoleUi<&[u8]> {
        ConsoleUi::new(policy, input.as_bytes())
    }

    #[test]
    fn test_policy_answers_without_reading() {
        let coord = ChunkCoord::new(1, 2);
        let mut regen = ui(CorruptChunkPolicy::Regenerate, "a\n");
        assert_eq!(
            regen.show_corrupt_chunk_dialog(coord),
            CorruptChunkChoice::Regenerate
        );
        let mut abort = ui(CorruptChunkPolicy::Abort, "r\n");
        assert_eq!(abort.show_corrupt_chunk_dialog(coord), CorruptChunkChoice::Abort);
        assert_eq!(abort.prompts(), 1);
    }

    #[test]
    fn test_ask_reads_answer() {
        let coord = ChunkCoord::new(0, 0);
        let mut console = ui(CorruptChunkPolicy::Ask, "R\nabort\n");
        assert_eq!(
            console.show_corrupt_chunk_dialog(coord),
            CorruptChunkChoice::Regenerate
        );
        assert_eq!(
            console.show_corrupt_chunk_dialog(coord),
            CorruptChunkChoice::Abort
        );
    }

    #[test]
    fn test_ask_at_end_of_input_aborts() {
        let mut console = ui(CorruptChunkPolicy::Ask, "");
        assert_eq!(
            console.show_corrupt_chunk_dialog(ChunkCoord::new(3, 3)),
            CorruptChunkChoice::Abort
        );
    }

    #[test]
    fn test_loading_flag_follows_store() {
        let mut console = ui(CorruptChunkPolicy::Abort, "");
        console.show_loading_screen(true);
        assert!(console.is_loading());
        console.show_loading_screen(false);
        assert!(!console.is_loading());
    }

    #[test]
    fn test_counting_physics() {
        let torch = |id| EntityInstance::new(ObjectId(id), Vec2::ZERO, Box::new(Torch { lit: true }));
        let mut physics = CountingPhysics::default();
        physics.add_entities(&[torch(1), torch(2)]);
        physics.remove_entities(&[torch(1)]);
        assert_eq!(
            physics,
            CountingPhysics {
                active: 1,
                added: 2,
                removed: 1
            }
        );
    }
}
