//! I/O worker thread spawning.

use std::thread::{self, JoinHandle};

/// Spawn `num_workers` named threads, optionally pinned to CPUs from
/// `cpu_affinity` (round-robin when there are more workers than CPUs).
pub fn spawn_workers<F, R>(
    num_workers: usize,
    cpu_affinity: Option<&[usize]>,
    name_prefix: &str,
    worker_fn: F,
) -> Vec<JoinHandle<R>>
where
    F: Fn(usize) -> R + Send + Clone + 'static,
    R: Send + 'static,
{
    (0..num_workers)
        .map(|worker_id| {
            let cpu_id = cpu_affinity.map(|cpus| cpus[worker_id % cpus.len()]);
            let worker_fn = worker_fn.clone();

            thread::Builder::new()
                .name(format!("{name_prefix}-{worker_id}"))
                .spawn(move || {
                    if let Some(cpu) = cpu_id
                        && let Err(e) = set_cpu_affinity(cpu)
                    {
                        tracing::warn!("failed to pin worker {worker_id} to cpu {cpu}: {e}");
                    }
                    worker_fn(worker_id)
                })
                .expect("failed to spawn worker thread")
        })
        .collect()
}

/// Wait for all worker threads to complete.
pub fn join_workers<R>(handles: Vec<JoinHandle<R>>) -> Vec<R> {
    handles
        .into_iter()
        .map(|h| h.join().expect("worker thread panicked"))
        .collect()
}

/// Pin the current thread to a single CPU (Linux only; no-op elsewhere).
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cpu_id: usize) -> Result<(), String> {
    use std::mem;

    unsafe {
        let mut cpu_set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(cpu_id, &mut cpu_set);

        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set) == 0 {
            Ok(())
        } else {
            Err(format!(
                "sched_setaffinity failed: {}",
                std::io::Error::last_os_error()
            ))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cpu_id: usize) -> Result<(), String> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_join() {
        let handles = spawn_workers(3, None, "test", |id| id * 2);
        let mut results = join_workers(handles);
        results.sort_unstable();
        assert_eq!(results, vec![0, 2, 4]);
    }

    #[test]
    fn test_affinity_round_robin() {
        // More workers than CPUs just wraps around; the workers still run.
        let handles = spawn_workers(4, Some(&[0]), "pin", |id| id);
        let mut results = join_workers(handles);
        results.sort_unstable();
        assert_eq!(results, vec![0, 1, 2, 3]);
    }
}
