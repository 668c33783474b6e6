use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// Fan-out registry of subscriber callbacks.
///
/// `notify` snapshots the callback list and releases the lock before calling
/// out, so a subscriber may subscribe or unsubscribe from inside its callback.
pub struct Listeners<T> {
    inner: Arc<Mutex<ListenerSet<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Listeners {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Listeners {
            inner: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = match self.inner.lock() {
            Ok(mut set) => {
                let id = set.next_id;
                set.next_id += 1;
                set.callbacks.push((id, Arc::new(callback)));
                id
            }
            Err(_) => {
                log::error!("Listener registry poisoned; subscription ignored");
                return Subscription { remove: None };
            }
        };

        let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Ok(mut set) = inner.lock() {
                        set.callbacks.retain(|(cid, _)| *cid != id);
                    }
                }
            })),
        }
    }

    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = match self.inner.lock() {
            Ok(set) => set.callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|s| s.callbacks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `on_message`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fan_out_to_all_subscribers() {
        let listeners: Listeners<u32> = Listeners::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _a = listeners.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = total.clone();
        let _b = listeners.subscribe(move |v| {
            t2.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        listeners.notify(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn test_unsubscribe_and_drop() {
        let listeners: Listeners<u32> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        let a = listeners.subscribe(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        {
            let h2 = hits.clone();
            let _scoped = listeners.subscribe(move |_| {
                h2.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(listeners.len(), 2);
        }
        assert_eq!(listeners.len(), 1);

        listeners.notify(&0);
        a.unsubscribe();
        listeners.notify(&0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let listeners: Listeners<u32> = Listeners::new();
        let sub = listeners.subscribe(|_| {});
        drop(listeners);
        sub.unsubscribe();
    }
}
