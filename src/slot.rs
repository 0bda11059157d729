//! Consumer slots: the fixed inputs of the batch aggregator.

use crate::channel::ChannelName;
use crate::error::{RotationError, RotationResult};

/// Routes channel data to aggregator inputs.
///
/// Commands take effect at the transport's own pace. Subscribing to a channel
/// with no live publisher is valid and simply yields no data.
pub trait Transport {
    fn subscribe(&mut self, slot: usize, channel: &ChannelName);

    fn unsubscribe(&mut self, slot: usize);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn subscribe(&mut self, slot: usize, channel: &ChannelName) {
        (**self).subscribe(slot, channel)
    }

    fn unsubscribe(&mut self, slot: usize) {
        (**self).unsubscribe(slot)
    }
}

/// Fixed array of slots, each optionally subscribed to one channel.
pub struct ConsumerSlotPool<T: Transport> {
    transport: T,
    slots: Vec<Option<ChannelName>>,
}

impl<T: Transport> ConsumerSlotPool<T> {
    pub fn new(transport: T, count: usize) -> Self {
        Self {
            transport,
            slots: vec![None; count],
        }
    }

    pub fn subscribe(&mut self, index: usize, channel: &ChannelName) -> RotationResult<()> {
        let slots = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(RotationError::SlotOutOfRange { index, slots })?;
        self.transport.subscribe(index, channel);
        *slot = Some(channel.clone());
        log::debug!("slot {} listening to {}", index, channel);
        Ok(())
    }

    /// Clear a slot's subscription. Already-clear slots are left untouched.
    pub fn unsubscribe(&mut self, index: usize) -> RotationResult<()> {
        let slots = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(RotationError::SlotOutOfRange { index, slots })?;
        if let Some(previous) = slot.take() {
            self.transport.unsubscribe(index);
            log::debug!("slot {} stopped listening to {}", index, previous);
        }
        Ok(())
    }

    pub fn unsubscribe_all(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.take().is_some() {
                self.transport.unsubscribe(index);
            }
        }
    }

    pub fn subscription(&self, index: usize) -> Option<&ChannelName> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn subscriptions(&self) -> &[Option<ChannelName>] {
        &self.slots
    }

    pub fn subscribed_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(usize, Option<String>)>,
    }

    impl Transport for Recorder {
        fn subscribe(&mut self, slot: usize, channel: &ChannelName) {
            self.calls.push((slot, Some(channel.to_string())));
        }

        fn unsubscribe(&mut self, slot: usize) {
            self.calls.push((slot, None));
        }
    }

    #[test]
    fn subscribe_and_unsubscribe_reach_transport() {
        let mut pool = ConsumerSlotPool::new(Recorder::default(), 2);
        pool.subscribe(1, &ChannelName::new("ch-03")).expect("subscribe");
        assert_eq!(pool.subscription(1).map(|c| c.as_str()), Some("ch-03"));

        pool.unsubscribe(1).expect("unsubscribe");
        assert_eq!(pool.subscription(1), None);
        assert_eq!(
            pool.transport().calls,
            vec![(1, Some("ch-03".to_string())), (1, None)]
        );
    }

    #[test]
    fn unsubscribe_on_clear_slot_is_noop() {
        let mut pool = ConsumerSlotPool::new(Recorder::default(), 3);
        pool.unsubscribe(0).expect("first");
        pool.unsubscribe(0).expect("second");
        pool.unsubscribe_all();
        assert!(pool.transport().calls.is_empty());
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let mut pool = ConsumerSlotPool::new(Recorder::default(), 2);
        let err = pool
            .subscribe(2, &ChannelName::new("ch-00"))
            .expect_err("slot 2 does not exist");
        assert!(matches!(
            err,
            RotationError::SlotOutOfRange { index: 2, slots: 2 }
        ));
        assert!(pool.unsubscribe(5).is_err());
    }
}
