// Packet transform steps.
//
// A session buffer can carry an ordered list of transforms applied to whole
// packets: send steps run in registration order just before a packet hits
// the wire, read steps run in reverse order right after reassembly. This is
// the seam for packet-level concerns like compression — the core ships none
// by default, and the diagnostic pre/post-transform dumps in `buffer.rs`
// bracket exactly this stage.

use rookery_protocol::Packet;

/// One packet-level transform step.
pub trait PacketTransform: Send {
    /// Applied to an outgoing packet before it is written.
    fn on_send(&mut self, packet: &mut Packet);

    /// Applied to an incoming packet after reassembly, before message
    /// extraction.
    fn on_read(&mut self, packet: &mut Packet);
}

/// Run all send steps in registration order.
pub fn apply_send_steps(steps: &mut [Box<dyn PacketTransform>], packet: &mut Packet) {
    for step in steps.iter_mut() {
        step.on_send(packet);
    }
}

/// Run all read steps in reverse registration order, undoing the send
/// pipeline layer by layer.
pub fn apply_read_steps(steps: &mut [Box<dyn PacketTransform>], packet: &mut Packet) {
    for step in steps.iter_mut().rev() {
        step.on_read(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tags the header timestamp so apply order is observable.
    struct AddTag(i64);

    impl PacketTransform for AddTag {
        fn on_send(&mut self, packet: &mut Packet) {
            packet.header.timestamp = packet.header.timestamp * 10 + self.0;
        }

        fn on_read(&mut self, packet: &mut Packet) {
            assert_eq!(packet.header.timestamp % 10, self.0);
            packet.header.timestamp /= 10;
        }
    }

    #[test]
    fn read_steps_undo_send_steps_in_reverse() {
        let mut steps: Vec<Box<dyn PacketTransform>> =
            vec![Box::new(AddTag(1)), Box::new(AddTag(2))];

        let mut packet = Packet::new();
        packet.header.timestamp = 7;
        apply_send_steps(&mut steps, &mut packet);
        assert_eq!(packet.header.timestamp, 712);

        apply_read_steps(&mut steps, &mut packet);
        assert_eq!(packet.header.timestamp, 7);
    }

    #[test]
    fn no_steps_is_a_noop() {
        let mut steps: Vec<Box<dyn PacketTransform>> = Vec::new();
        let mut packet = Packet::new();
        packet.header.timestamp = 42;
        apply_send_steps(&mut steps, &mut packet);
        apply_read_steps(&mut steps, &mut packet);
        assert_eq!(packet.header.timestamp, 42);
    }
}
