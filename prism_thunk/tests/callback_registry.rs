//! Binding object state to a C-style callback registry.
//!
//! The registry below mimics a windowing library: it stores one bare
//! function pointer per window and invokes it with the window handle and
//! the key event fields. Each `Input` object receives its own events
//! through a closure even though the registry has no user-data slot.

#![cfg(target_arch = "x86_64")]

use std::cell::RefCell;

use prism_thunk::{ArenaConfig, Thunk, ThunkContext};

// =============================================================================
// Registry
// =============================================================================

type KeyCallback = extern "win64" fn(*mut Window, i32, i32, i32, i32);

const PRESS: i32 = 1;
const RELEASE: i32 = 0;
const MOD_SHIFT: i32 = 0x0001;

#[derive(Default)]
struct Window {
    key_callback: Option<KeyCallback>,
}

/// Install `callback`, returning the previous one.
fn set_key_callback(window: &mut Window, callback: Option<KeyCallback>) -> Option<KeyCallback> {
    std::mem::replace(&mut window.key_callback, callback)
}

/// Deliver a key event the way the library's event loop would.
fn dispatch_key(window: &mut Window, key: i32, scancode: i32, action: i32, mods: i32) {
    if let Some(callback) = window.key_callback {
        callback(window as *mut Window, key, scancode, action, mods);
    }
}

// =============================================================================
// Input
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyEvent {
    window: *mut Window,
    key: i32,
    scancode: i32,
    action: i32,
    mods: i32,
}

struct Input {
    name: &'static str,
    events: RefCell<Vec<KeyEvent>>,
    held: RefCell<Vec<i32>>,
}

impl Input {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            events: RefCell::new(Vec::new()),
            held: RefCell::new(Vec::new()),
        }
    }

    extern "win64" fn on_key(
        &self,
        window: *mut Window,
        key: i32,
        scancode: i32,
        action: i32,
        mods: i32,
    ) {
        self.events.borrow_mut().push(KeyEvent {
            window,
            key,
            scancode,
            action,
            mods,
        });
        let mut held = self.held.borrow_mut();
        match action {
            PRESS => held.push(key),
            RELEASE => held.retain(|&k| k != key),
            _ => {}
        }
    }
}

#[test]
fn test_key_events_reach_bound_input() {
    let ctx = ThunkContext::new(ArenaConfig::for_testing());
    let mut window = Window::default();
    let input = Input::new("main");

    let thunk = Thunk::<KeyCallback, _>::new(&ctx, &input, Input::on_key).unwrap();
    let callback = unsafe { thunk.callback() };
    assert!(set_key_callback(&mut window, Some(callback)).is_none());

    dispatch_key(&mut window, 65, 30, PRESS, MOD_SHIFT);
    dispatch_key(&mut window, 66, 48, PRESS, 0);
    dispatch_key(&mut window, 65, 30, RELEASE, 0);

    let wptr = &mut window as *mut Window;
    assert_eq!(
        input.events.borrow().as_slice(),
        &[
            KeyEvent { window: wptr, key: 65, scancode: 30, action: PRESS, mods: MOD_SHIFT },
            KeyEvent { window: wptr, key: 66, scancode: 48, action: PRESS, mods: 0 },
            KeyEvent { window: wptr, key: 65, scancode: 30, action: RELEASE, mods: 0 },
        ]
    );
    assert_eq!(input.held.borrow().as_slice(), &[66]);
    assert_eq!(input.name, "main");
}

#[test]
fn test_each_window_reaches_its_own_input() {
    let ctx = ThunkContext::new(ArenaConfig::for_testing());
    let mut left = Window::default();
    let mut right = Window::default();
    let left_input = Input::new("left");
    let right_input = Input::new("right");

    let left_thunk = Thunk::<KeyCallback, _>::new(&ctx, &left_input, Input::on_key).unwrap();
    let right_thunk = Thunk::<KeyCallback, _>::new(&ctx, &right_input, Input::on_key).unwrap();
    set_key_callback(&mut left, Some(unsafe { left_thunk.callback() }));
    set_key_callback(&mut right, Some(unsafe { right_thunk.callback() }));

    dispatch_key(&mut left, 1, 2, PRESS, 0);
    dispatch_key(&mut right, 3, 4, PRESS, 0);
    dispatch_key(&mut right, 5, 6, PRESS, 0);

    assert_eq!(left_input.events.borrow().len(), 1);
    assert_eq!(right_input.events.borrow().len(), 2);
    assert_eq!(left_input.held.borrow().as_slice(), &[1]);
    assert_eq!(right_input.held.borrow().as_slice(), &[3, 5]);
}

#[test]
fn test_unregistering_before_drop() {
    let ctx = ThunkContext::new(ArenaConfig::for_testing());
    let mut window = Window::default();
    let input = Input::new("transient");

    {
        let thunk = Thunk::<KeyCallback, _>::new(&ctx, &input, Input::on_key).unwrap();
        set_key_callback(&mut window, Some(unsafe { thunk.callback() }));
        dispatch_key(&mut window, 9, 9, PRESS, 0);
        let previous = set_key_callback(&mut window, None);
        assert_eq!(previous.map(|f| f as usize), Some(thunk.code_address()));
    }

    dispatch_key(&mut window, 10, 10, PRESS, 0);
    assert_eq!(input.events.borrow().len(), 1);
    assert_eq!(ctx.arena().stats().live_regions(), 0);
}
