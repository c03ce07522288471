// Prepared class tracking
//
// The runtime reports class unloads without saying which class went away, so
// the signatures of all prepared classes are remembered and diffed against the
// loaded set whenever unloads are pending.

use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct ClassTracker {
    signatures: HashSet<String>,
}

impl ClassTracker {
    /// Remember a newly prepared class.
    pub fn add(&mut self, signature: String) {
        self.signatures.insert(signature);
    }

    /// Forget every class not in `loaded` and return their signatures.
    pub fn process_unloads(&mut self, loaded: &[String]) -> Vec<String> {
        let loaded: HashSet<&str> = loaded.iter().map(String::as_str).collect();
        let mut unloaded: Vec<String> = self
            .signatures
            .iter()
            .filter(|sig| !loaded.contains(sig.as_str()))
            .cloned()
            .collect();
        for sig in &unloaded {
            self.signatures.remove(sig);
        }
        unloaded.sort();
        unloaded
    }

    /// Start over from the classes loaded right now.
    pub fn reset(&mut self, loaded: Vec<String>) {
        self.signatures = loaded.into_iter().collect();
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
