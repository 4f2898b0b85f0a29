//! Anti-idle pointer nudges.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

pub const MAX_OFFSET: i32 = 3;
pub const MIN_WAIT_SECS: u64 = 30;
pub const MAX_WAIT_SECS: u64 = 60;
pub const RETURN_PAUSE: Duration = Duration::from_millis(100);

/// Something that can report and set the pointer position.
pub trait Pointer {
    fn position(&mut self) -> Result<(i32, i32)>;
    fn move_to(&mut self, x: i32, y: i32) -> Result<()>;
}

/// Move the pointer by a small random offset and put it back.
pub async fn nudge_once<P: Pointer, R: Rng>(pointer: &mut P, rng: &mut R) -> Result<(i32, i32)> {
    let (x, y) = pointer.position()?;
    let dx = rng.gen_range(-MAX_OFFSET..=MAX_OFFSET);
    let dy = rng.gen_range(-MAX_OFFSET..=MAX_OFFSET);
    pointer.move_to(x + dx, y + dy)?;
    tokio::time::sleep(RETURN_PAUSE).await;
    pointer.move_to(x, y)?;
    debug!(x, y, dx, dy, "nudged pointer");
    Ok((dx, dy))
}

pub fn next_wait<R: Rng>(rng: &mut R) -> Duration {
    Duration::from_secs(rng.gen_range(MIN_WAIT_SECS..=MAX_WAIT_SECS))
}

/// Nudge at random intervals until Ctrl+C; returns the number of nudges.
pub async fn run<P: Pointer>(mut pointer: P) -> Result<u64> {
    let mut rng = StdRng::from_entropy();
    let mut nudges = 0u64;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    info!("keep-awake started; press Ctrl+C to stop");

    loop {
        let wait = next_wait(&mut rng);
        debug!(wait_secs = wait.as_secs(), "waiting");
        tokio::select! {
            res = &mut shutdown => {
                res.context("listening for Ctrl+C")?;
                break;
            }
            _ = tokio::time::sleep(wait) => {}
        }
        match nudge_once(&mut pointer, &mut rng).await {
            Ok(_) => nudges += 1,
            Err(err) => warn!(error = %format!("{err:#}"), "could not move pointer"),
        }
    }

    info!(nudges, "keep-awake stopped");
    Ok(nudges)
}

#[cfg(feature = "mouse")]
pub use native::EnigoPointer;

#[cfg(feature = "mouse")]
mod native {
    use anyhow::{anyhow, Result};
    use enigo::{Coordinate, Enigo, Mouse, Settings};

    use super::Pointer;

    pub struct EnigoPointer {
        enigo: Enigo,
    }

    impl EnigoPointer {
        pub fn new() -> Result<Self> {
            let enigo = Enigo::new(&Settings::default())
                .map_err(|e| anyhow!("connecting to the display: {e}"))?;
            Ok(Self { enigo })
        }
    }

    impl Pointer for EnigoPointer {
        fn position(&mut self) -> Result<(i32, i32)> {
            self.enigo
                .location()
                .map_err(|e| anyhow!("reading pointer position: {e}"))
        }

        fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
            self.enigo
                .move_mouse(x, y, Coordinate::Abs)
                .map_err(|e| anyhow!("moving pointer: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[derive(Default)]
    struct FakePointer {
        at: (i32, i32),
        moves: Vec<(i32, i32)>,
        broken: bool,
    }

    impl Pointer for FakePointer {
        fn position(&mut self) -> Result<(i32, i32)> {
            if self.broken {
                bail!("no display");
            }
            Ok(self.at)
        }

        fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
            self.moves.push((x, y));
            self.at = (x, y);
            Ok(())
        }
    }

    #[tokio::test]
    async fn nudge_returns_pointer_to_start() {
        let mut pointer = FakePointer {
            at: (400, 300),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            let (dx, dy) = nudge_once(&mut pointer, &mut rng).await.expect("nudge");
            assert!((-MAX_OFFSET..=MAX_OFFSET).contains(&dx));
            assert!((-MAX_OFFSET..=MAX_OFFSET).contains(&dy));
        }
        assert_eq!(pointer.moves.len(), 10);
        assert_eq!(pointer.at, (400, 300));
        assert!(pointer.moves.iter().all(|(x, y)| (x - 400).abs() <= 3 && (y - 300).abs() <= 3));
    }

    #[tokio::test]
    async fn unreadable_pointer_is_an_error() {
        let mut pointer = FakePointer {
            broken: true,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert!(nudge_once(&mut pointer, &mut rng).await.is_err());
        assert!(pointer.moves.is_empty());
    }

    #[test]
    fn waits_stay_between_thirty_and_sixty_seconds() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let wait = next_wait(&mut rng).as_secs();
            assert!((MIN_WAIT_SECS..=MAX_WAIT_SECS).contains(&wait));
        }
    }
}
