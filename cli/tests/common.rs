//! Test utilities for CLI crate integration tests.
#![allow(missing_docs)]
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A writer whose contents stay readable after it was handed away
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).expect("utf-8 output")
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Write `contents` to a supervision file inside `dir`
pub fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("chaperone.toml");
    std::fs::write(&path, contents).expect("write config");
    path
}

/// Path of the compiled `chaperone` binary
pub fn chaperone_bin() -> &'static str {
    env!("CARGO_BIN_EXE_chaperone")
}
