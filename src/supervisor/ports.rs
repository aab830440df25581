//! Bounded free-list of ports handed to local providers.

use std::sync::Mutex;

/// LIFO pool over `[start, end]`. A released port is the next one handed out.
///
/// All operations take one short lock, so reservation is atomic with respect to
/// concurrent starts and no two live handles ever share a port.
pub struct PortPool {
    free: Mutex<Vec<u16>>,
    capacity: usize,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        // Reversed so the lowest port is popped first.
        let free: Vec<u16> = (start..=end).rev().collect();
        let capacity = free.len();
        Self {
            free: Mutex::new(free),
            capacity,
        }
    }

    pub fn acquire(&self) -> Option<u16> {
        self.acquire_with(|_| true)
    }

    /// Take the most recently freed port for which `usable` holds.
    /// Ports failing the check stay in the pool.
    pub fn acquire_with(&self, usable: impl Fn(u16) -> bool) -> Option<u16> {
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        let idx = free.iter().rposition(|p| usable(*p))?;
        Some(free.remove(idx))
    }

    pub fn release(&self, port: u16) {
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        if !free.contains(&port) {
            free.push(port);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// True if nothing else is listening on `host:port`.
pub fn port_is_free(host: &str, port: u16) -> bool {
    std::net::TcpListener::bind((host, port)).is_ok()
}
