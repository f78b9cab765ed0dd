//! Double-buffered input state of remote players.

/// Logical input actions, one bit each in the pressed mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PlayerAction {
    Left = 0,
    Right = 1,
    Up = 2,
    Down = 3,
    Fire = 4,
    Jump = 5,
    Run = 6,
    ChangeWeapon = 7,
    Menu = 8,
}

impl PlayerAction {
    pub fn mask(self) -> u64 {
        1u64 << (self as u8)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerInputState {
    pub pressed: u64,
    /// Mask at the start of `updated_frame`; edges are measured against it
    pub pressed_last: u64,
    pub updated_frame: u32,
}

impl PlayerInputState {
    /// Applies a key-press report received during `frame`.
    pub fn apply(&mut self, pressed: u64, frame: u32) {
        self.begin_frame(frame);
        self.pressed = pressed;
    }

    /// Ages the previous mask once per frame, no matter how many reports
    /// arrive in it.
    pub fn begin_frame(&mut self, frame: u32) {
        if self.updated_frame != frame {
            self.updated_frame = frame;
            self.pressed_last = self.pressed;
        }
    }

    pub fn is_pressed(&self, action: PlayerAction) -> bool {
        self.pressed & action.mask() != 0
    }

    /// Pressed now but not at the end of the previous frame.
    pub fn is_hit(&self, action: PlayerAction) -> bool {
        self.pressed & !self.pressed_last & action.mask() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_lasts_one_frame() {
        let mut input = PlayerInputState::default();
        input.apply(PlayerAction::Jump.mask(), 1);
        assert!(input.is_pressed(PlayerAction::Jump));
        assert!(input.is_hit(PlayerAction::Jump));

        input.begin_frame(2);
        assert!(input.is_pressed(PlayerAction::Jump));
        assert!(!input.is_hit(PlayerAction::Jump));
    }

    #[test]
    fn test_multiple_reports_in_one_frame() {
        let mut input = PlayerInputState::default();
        input.apply(PlayerAction::Fire.mask(), 3);
        input.apply(PlayerAction::Fire.mask() | PlayerAction::Left.mask(), 3);
        assert!(input.is_hit(PlayerAction::Fire));
        assert!(input.is_hit(PlayerAction::Left));
        assert!(!input.is_pressed(PlayerAction::Right));
        assert_eq!(input.updated_frame, 3);
    }

    #[test]
    fn test_frame_is_aged_once() {
        let mut input = PlayerInputState::default();
        input.apply(PlayerAction::Jump.mask(), 1);
        input.begin_frame(2);
        input.apply(0, 2);
        input.apply(PlayerAction::Jump.mask(), 2);
        // Released and pressed again within frame 2: no new edge
        assert!(!input.is_hit(PlayerAction::Jump));

        input.begin_frame(2);
        assert_eq!(input.pressed_last, PlayerAction::Jump.mask());
        input.begin_frame(3);
        input.apply(0, 3);
        assert_eq!(input.pressed_last, PlayerAction::Jump.mask());
        assert!(!input.is_pressed(PlayerAction::Jump));
    }

    #[test]
    fn test_release_is_not_a_hit() {
        let mut input = PlayerInputState::default();
        input.apply(PlayerAction::Run.mask(), 1);
        input.begin_frame(2);
        input.apply(0, 2);
        assert!(!input.is_pressed(PlayerAction::Run));
        assert!(!input.is_hit(PlayerAction::Run));
    }
}
