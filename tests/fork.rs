//! Fork correctness: every allocator lock is taken around fork(), so
//! both sides can allocate immediately afterwards.

#![cfg(unix)]

use shardalloc::ShardAlloc;

#[test]
fn test_fork_child_can_allocate() {
    let heap = ShardAlloc::with_defaults();
    let p = heap.alloc(10_000);
    assert!(!p.is_null());
    unsafe { p.write(0x42) };

    // SAFETY: fork/waitpid with a child that only touches the allocator
    // and _exits.
    unsafe {
        match libc::fork() {
            -1 => panic!("fork failed"),
            0 => {
                // Child: locks were reinitialized; allocation must
                // neither deadlock nor fail, and parent data is intact.
                let ok = p.read() == 0x42;
                let q = heap.alloc(4096);
                let code = if ok && !q.is_null() {
                    q.write(1);
                    heap.free(q);
                    0
                } else {
                    1
                };
                libc::_exit(code);
            }
            pid => {
                let mut status = 0;
                assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
                assert!(libc::WIFEXITED(status), "child crashed");
                assert_eq!(libc::WEXITSTATUS(status), 0, "child allocation failed");

                // Parent side keeps working too.
                let q = heap.alloc(4096);
                assert!(!q.is_null());
                heap.free(q);
                heap.free(p);
            }
        }
    }
}
