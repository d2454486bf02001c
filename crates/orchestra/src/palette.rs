//! Label colors for process output

use crossterm::style::{Color, Stylize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Colors handed out in order, wrapping around
pub const DEFAULT_PALETTE: [Color; 6] = [
    Color::Rgb { r: 255, g: 100, b: 100 },
    Color::Rgb { r: 100, g: 200, b: 100 },
    Color::Rgb { r: 100, g: 100, b: 200 },
    Color::Rgb { r: 200, g: 200, b: 0 },
    Color::Rgb { r: 200, g: 0, b: 200 },
    Color::Rgb { r: 0, g: 200, b: 200 },
];

/// Round-robin color allocator.
///
/// Each orchestrator owns its own cycle, so allocation order only depends on
/// the order labels are requested.
#[derive(Debug)]
pub struct ColorCycle {
    palette: Vec<Color>,
    next: AtomicUsize,
}

impl ColorCycle {
    pub fn new(palette: impl Into<Vec<Color>>) -> Self {
        Self {
            palette: palette.into(),
            next: AtomicUsize::new(0),
        }
    }

    /// Next color of the cycle (white for an empty palette)
    pub fn next_color(&self) -> Color {
        if self.palette.is_empty() {
            return Color::White;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.palette.len();
        self.palette[index]
    }

    /// `text` wrapped in the escape codes of the next color
    pub fn paint(&self, text: &str) -> String {
        text.with(self.next_color()).to_string()
    }
}

impl Default for ColorCycle {
    fn default() -> Self {
        Self::new(DEFAULT_PALETTE)
    }
}
