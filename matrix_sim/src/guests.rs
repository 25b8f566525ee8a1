//! Guest programs (WebAssembly text) used by the scenarios.
//!
//! Working-buffer layout shared with the host:
//!
//! | offset | size | contents                          |
//! |--------|------|-----------------------------------|
//! | 0      | 4    | target id length (i32, LE)        |
//! | 4      | ≤60  | target id bytes                   |
//! | 256    | 4    | tick counter written by the guest |

/// Working-buffer offset of the target id length.
pub const TARGET_OFFSET: u32 = 0;

/// Working-buffer offset of the guest's tick counter.
pub const TICKS_OFFSET: usize = 256;

/// Logs on start; each `tick` pulls its target from the working buffer,
/// sends it "ping" and stores an incremented tick counter back.
pub const PINGER: &str = r#"
(module
  (import "env" "log" (func $log (param i32 i32)))
  (import "env" "send" (func $send (param i32 i32 i32 i32)))
  (import "env" "get_memory" (func $get (param i32 i32)))
  (import "env" "set_memory" (func $set (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 128) "ping")
  (data (i32.const 192) "guest online")
  (global $ticks (mut i32) (i32.const 0))
  (func (export "_start")
    (call $log (i32.const 192) (i32.const 12)))
  (func (export "tick")
    (call $get (i32.const 0) (i32.const 64))
    (call $send (i32.const 4) (i32.load (i32.const 0)) (i32.const 128) (i32.const 4))
    (global.set $ticks (i32.add (global.get $ticks) (i32.const 1)))
    (i32.store (i32.const 256) (global.get $ticks))
    (call $set (i32.const 256) (i32.const 4))))
"#;

/// Never returns from `tick`; burns its fuel budget.
pub const SPINNER: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "tick")
    (loop $forever (br $forever))))
"#;

/// Asks the host to log a range past the end of its memory.
pub const TRESPASSER: &str = r#"
(module
  (import "env" "log" (func $log (param i32 i32)))
  (memory (export "memory") 1)
  (func (export "tick")
    (call $log (i32.const 65530) (i32.const 100))))
"#;

/// Encodes `target` in the layout `PINGER` expects.
pub fn target_record(target: &str) -> Vec<u8> {
    let mut record = (target.len() as u32).to_le_bytes().to_vec();
    record.extend_from_slice(target.as_bytes());
    record
}
