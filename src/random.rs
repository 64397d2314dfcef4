use anyhow::Result;
use std::sync::Mutex;

/// Source of the bytes handed out by `random_get`. Injected into the host
/// context so tests can run against a fixed sequence.
pub trait WasiRandom: Send + Sync {
    fn get(&self, buf: &mut [u8]) -> Result<()>;
}

/// Cryptographically strong randomness from the operating system.
pub struct GetRandom;

impl WasiRandom for GetRandom {
    fn get(&self, buf: &mut [u8]) -> Result<()> {
        getrandom::getrandom(buf)?;
        Ok(())
    }
}

/// An endlessly repeating byte sequence.
pub struct Deterministic {
    sequence: Mutex<std::iter::Cycle<std::vec::IntoIter<u8>>>,
}

impl Deterministic {
    pub fn new(bytes: Vec<u8>) -> Self {
        Deterministic {
            sequence: Mutex::new(bytes.into_iter().cycle()),
        }
    }
}

impl WasiRandom for Deterministic {
    fn get(&self, buf: &mut [u8]) -> Result<()> {
        let mut s = self.sequence.lock().unwrap();
        for b in buf.iter_mut() {
            *b = s.next().expect("infinite sequence");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deterministic_cycles() {
        let d = Deterministic::new(vec![1, 2, 3]);
        let mut buf = [0u8; 7];
        d.get(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 1, 2, 3, 1]);
    }
}
