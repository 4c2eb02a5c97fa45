use dltview_types::Window;

use crate::SessionConfig;

/// Scroll hysteresis deciding when the page window has to move.
#[derive(Clone, Copy, Debug)]
pub struct WindowPolicy {
    pub page_size: u32,
    pub load_threshold: f64,
    pub unload_threshold: f64,
    pub shift_fraction: f64,
    pub min_viewport_span: u32,
}

impl WindowPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            page_size: config.page_size,
            load_threshold: config.load_threshold,
            unload_threshold: config.unload_threshold,
            shift_fraction: config.shift_fraction,
            min_viewport_span: config.min_viewport_span,
        }
    }

    fn scaled(&self, fraction: f64) -> u32 {
        (f64::from(self.page_size) * fraction) as u32
    }

    pub fn shift(&self) -> u32 {
        self.scaled(self.shift_fraction).max(1)
    }

    /// New skip offset for a visible range `[top, bottom]` of the page, or
    /// `None` if the window stays.
    ///
    /// Scrolling near the top wins over scrolling near the bottom, so one
    /// notification moves the window at most once. Moving forward needs a
    /// full page, otherwise there is nothing more to load.
    pub fn plan(&self, top: u32, bottom: u32, skip: u32, visible: usize) -> Option<u32> {
        if bottom < top || bottom - top <= self.min_viewport_span {
            return None;
        }
        if top <= self.scaled(self.load_threshold) && skip > 0 {
            return Some(skip.saturating_sub(self.shift()));
        }
        if bottom >= self.scaled(self.unload_threshold) && visible == self.page_size as usize {
            return Some(skip.saturating_add(self.shift()));
        }
        None
    }

    /// Skip offset that brings absolute `index` into view, or `None` if the
    /// current window already holds it.
    pub fn reveal(&self, index: u32, skip: u32) -> Option<u32> {
        if Window::page(skip, self.page_size).contains(index) {
            return None;
        }
        Some(index.saturating_sub(self.page_size / 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(page_size: u32) -> WindowPolicy {
        WindowPolicy::from_config(&SessionConfig {
            page_size,
            ..SessionConfig::default()
        })
    }

    #[test]
    fn tiny_viewports_are_ignored() {
        let p = policy(400_000);
        assert_eq!(p.plan(5, 15, 0, 400_000), None);
        assert_eq!(p.plan(5, 15, 1000, 400_000), None);
        assert_eq!(p.plan(5, 14, 1000, 400_000), None);
        assert_eq!(p.plan(5, 16, 1000, 400_000), Some(0));
    }

    #[test]
    fn near_bottom_of_full_page_moves_forward() {
        let p = policy(400_000);
        let skip = p.plan(399_900, 399_999, 0, 400_000).unwrap();
        assert_eq!(skip, 200_000);
        assert_eq!(Window::page(skip, 400_000), Window::new(200_000, 600_000));
    }

    #[test]
    fn partial_page_never_moves_forward() {
        let p = policy(1000);
        assert_eq!(p.plan(850, 990, 0, 999), None);
    }

    #[test]
    fn near_top_moves_backward_and_clamps() {
        let p = policy(1000);
        assert_eq!(p.plan(100, 200, 2000, 1000), Some(1500));
        assert_eq!(p.plan(100, 200, 300, 1000), Some(0));
        assert_eq!(p.plan(100, 200, 0, 1000), None);
    }

    #[test]
    fn top_takes_precedence_over_bottom() {
        let p = policy(1000);
        // range covers both thresholds
        assert_eq!(p.plan(0, 999, 4000, 1000), Some(3500));
    }

    #[test]
    fn reveal_centers_out_of_window_index() {
        let p = policy(1000);
        assert_eq!(p.reveal(500, 0), None);
        assert_eq!(p.reveal(5000, 0), Some(4500));
        assert_eq!(p.reveal(100, 4000), Some(0));
    }
}
