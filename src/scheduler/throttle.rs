use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Wait suggested when a user is at the in-flight cap but not the rate cap.
const BUSY_RETRY: Duration = Duration::from_secs(1);

/// Per-user admission control: at most `limit` tasks started in any rolling
/// `window`, and at most `limit` running at once.
#[derive(Clone)]
pub(crate) struct UserThrottle {
    limit: usize,
    window: Duration,
    users: Arc<Mutex<HashMap<String, UserWindow>>>,
}

#[derive(Default)]
struct UserWindow {
    admitted: VecDeque<Instant>,
    in_flight: usize,
}

pub(crate) enum Admission {
    Admitted(ThrottlePermit),
    /// Try again after this long.
    Deferred(Duration),
}

/// Holds one of the user's in-flight slots until dropped.
pub(crate) struct ThrottlePermit {
    user_id: String,
    users: Arc<Mutex<HashMap<String, UserWindow>>>,
}

impl UserThrottle {
    pub(crate) fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            users: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn per_minute(limit: usize) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub(crate) fn try_admit(&self, user_id: &str) -> Admission {
        let now = Instant::now();
        let window = self.window;
        let mut users = lock(&self.users);
        users.retain(|_, w| {
            w.in_flight > 0 || w.admitted.back().is_some_and(|t| now - *t < window)
        });

        let entry = users.entry(user_id.to_string()).or_default();
        while entry
            .admitted
            .front()
            .is_some_and(|t| now - *t >= window)
        {
            entry.admitted.pop_front();
        }

        if entry.admitted.len() >= self.limit {
            let wait = entry
                .admitted
                .front()
                .map(|oldest| window.saturating_sub(now - *oldest))
                .unwrap_or(BUSY_RETRY);
            return Admission::Deferred(wait.max(Duration::from_millis(1)));
        }
        if entry.in_flight >= self.limit {
            return Admission::Deferred(BUSY_RETRY);
        }

        entry.admitted.push_back(now);
        entry.in_flight += 1;
        Admission::Admitted(ThrottlePermit {
            user_id: user_id.to_string(),
            users: self.users.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self, user_id: &str) -> usize {
        lock(&self.users).get(user_id).map_or(0, |w| w.in_flight)
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        if let Some(w) = lock(&self.users).get_mut(&self.user_id) {
            w.in_flight = w.in_flight.saturating_sub(1);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
