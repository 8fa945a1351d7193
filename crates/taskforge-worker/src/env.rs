use std::collections::HashMap;

/// Exports variables into the process environment, restoring the prior
/// values when dropped.
///
/// The agent CLI inherits the worker's environment, so resolved secrets
/// are exported for the duration of one run. Restoration runs on every
/// exit path. Exporting is racy across concurrent agent runs in one
/// process; the worker's single execution slot serializes them.
pub struct EnvGuard {
    saved: Vec<(String, Option<String>)>,
}

impl EnvGuard {
    pub fn export(vars: &HashMap<String, String>) -> Self {
        let mut saved = Vec::with_capacity(vars.len());
        for (key, value) in vars {
            saved.push((key.clone(), std::env::var(key).ok()));
            std::env::set_var(key, value);
        }
        Self { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.saved.drain(..) {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_and_restore() {
        std::env::set_var("TFORGE_ENV_TEST_A", "original");
        std::env::remove_var("TFORGE_ENV_TEST_B");

        let mut vars = HashMap::new();
        vars.insert("TFORGE_ENV_TEST_A".to_string(), "patched".to_string());
        vars.insert("TFORGE_ENV_TEST_B".to_string(), "fresh".to_string());

        {
            let _guard = EnvGuard::export(&vars);
            assert_eq!(std::env::var("TFORGE_ENV_TEST_A").unwrap(), "patched");
            assert_eq!(std::env::var("TFORGE_ENV_TEST_B").unwrap(), "fresh");
        }

        assert_eq!(std::env::var("TFORGE_ENV_TEST_A").unwrap(), "original");
        assert!(std::env::var("TFORGE_ENV_TEST_B").is_err());
    }
}
