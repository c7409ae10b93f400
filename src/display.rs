use crate::shutdown::ShutdownFlag;
use anyhow::{Context, Result};
use ratatui::crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ratatui::text::Line;
use ratatui::widgets::Paragraph;
use ratatui::DefaultTerminal;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

pub type PageId = Uuid;
pub type RenderFn = Box<dyn Fn() -> String + Send + Sync>;

/// Sink for the scheduler's self-refreshing views: one top page plus one page
/// per active worker. Pages are re-rendered lazily, only when marked dirty or
/// when the viewer navigates.
pub trait Screen: Send + Sync {
    fn set_top_page(&self, render: RenderFn);
    fn mark_top_dirty(&self);
    fn add_page(&self, render: RenderFn) -> PageId;
    fn refresh_page(&self, id: PageId);
    fn delete_page(&self, id: PageId);
    fn render(&self) -> Result<()>;
}

/// Screen that draws nothing; used by tests and `--no-tui` operation.
#[derive(Default)]
pub struct NullScreen;

impl NullScreen {
    pub fn new() -> Self {
        Self
    }
}

impl Screen for NullScreen {
    fn set_top_page(&self, _render: RenderFn) {}
    fn mark_top_dirty(&self) {}
    fn add_page(&self, _render: RenderFn) -> PageId {
        Uuid::new_v4()
    }
    fn refresh_page(&self, _id: PageId) {}
    fn delete_page(&self, _id: PageId) {}
    fn render(&self) -> Result<()> {
        Ok(())
    }
}

struct Page {
    id: PageId,
    render: RenderFn,
    offset: usize,
    dirty: bool,
}

struct ScreenState {
    pages: Vec<Page>,
    current: usize,
    lines: Vec<String>,
    drawn_page: Option<PageId>,
    drawn_offset: Option<usize>,
    width: u16,
    height: u16,
}

impl ScreenState {
    fn new() -> Self {
        Self {
            pages: vec![Page {
                id: Uuid::new_v4(),
                render: Box::new(String::new),
                offset: 0,
                dirty: true,
            }],
            current: 0,
            lines: Vec::new(),
            drawn_page: None,
            drawn_offset: None,
            width: 0,
            height: 0,
        }
    }

    fn add_page(&mut self, render: RenderFn) -> PageId {
        let id = Uuid::new_v4();
        self.pages.push(Page {
            id,
            render,
            offset: 0,
            dirty: true,
        });
        id
    }

    fn delete_page(&mut self, id: PageId) {
        let Some(index) = self.pages.iter().position(|p| p.id == id) else {
            return;
        };
        // The top page is never deleted.
        if index == 0 {
            return;
        }
        self.pages.remove(index);
        if self.current >= self.pages.len() {
            self.current = self.pages.len() - 1;
        }
        for page in &mut self.pages {
            page.dirty = true;
        }
    }

    fn mark_dirty(&mut self, id: PageId) {
        if let Some(page) = self.pages.iter_mut().find(|p| p.id == id) {
            page.dirty = true;
        }
    }

    fn next_page(&mut self) {
        self.current = (self.current + 1) % self.pages.len();
    }

    fn prev_page(&mut self) {
        self.current = if self.current == 0 {
            self.pages.len() - 1
        } else {
            self.current - 1
        };
    }

    fn scroll(&mut self, delta: isize) {
        let page = &mut self.pages[self.current];
        let max = self.lines.len();
        let next = page.offset as isize + delta;
        page.offset = next.clamp(0, max as isize) as usize;
    }
}

/// Cooperative paged terminal display over ratatui.
///
/// The scheduler calls `render` many times per sleep interval; each call
/// drains pending key events, lazily re-runs the current page's renderer if
/// it is dirty, and redraws when something changed. While the terminal is in
/// raw mode Ctrl-C arrives here as a key event, so it is translated into the
/// shutdown flag rather than a signal.
pub struct PagedScreen {
    state: Mutex<ScreenState>,
    terminal: Mutex<DefaultTerminal>,
    shutdown: ShutdownFlag,
}

impl PagedScreen {
    pub fn new(shutdown: ShutdownFlag) -> Result<Self> {
        let terminal = ratatui::try_init().context("Failed to initialise the terminal")?;
        Ok(Self {
            state: Mutex::new(ScreenState::new()),
            terminal: Mutex::new(terminal),
            shutdown,
        })
    }

    fn handle_input(&self, state: &mut ScreenState) -> Result<()> {
        while event::poll(Duration::ZERO)? {
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            let page_step = state.height.saturating_sub(1) as isize;
            match key.code {
                KeyCode::Left => state.prev_page(),
                KeyCode::Right => state.next_page(),
                KeyCode::Up => state.scroll(-1),
                KeyCode::Down => state.scroll(1),
                KeyCode::PageUp => state.scroll(-page_step),
                KeyCode::PageDown => state.scroll(page_step),
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    self.shutdown.set();
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for PagedScreen {
    fn drop(&mut self) {
        ratatui::restore();
    }
}

impl Screen for PagedScreen {
    fn set_top_page(&self, render: RenderFn) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.pages[0].render = render;
        state.pages[0].dirty = true;
    }

    fn mark_top_dirty(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.pages[0].dirty = true;
    }

    fn add_page(&self, render: RenderFn) -> PageId {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .add_page(render)
    }

    fn refresh_page(&self, id: PageId) {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .mark_dirty(id);
    }

    fn delete_page(&self, id: PageId) {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .delete_page(id);
    }

    fn render(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.handle_input(&mut state)?;

        let mut terminal = self.terminal.lock().unwrap_or_else(|p| p.into_inner());
        let size = terminal.size()?;
        let resized = size.width != state.width || size.height != state.height;
        state.width = size.width;
        state.height = size.height;

        let current = state.current;
        let current_id = state.pages[current].id;
        let should_update =
            resized || state.drawn_page != Some(current_id) || state.pages[current].dirty;
        if should_update {
            let content = (state.pages[current].render)();
            state.lines = wrap_content(&content, size.width as usize);
            state.pages[current].dirty = false;
            state.drawn_page = Some(current_id);
        }

        let offset = state.pages[current].offset.min(state.lines.len());
        if !should_update && state.drawn_offset == Some(offset) {
            return Ok(());
        }
        state.drawn_offset = Some(offset);

        let header = format!(
            "Page {} / {}, Offset {} / {}",
            current + 1,
            state.pages.len(),
            offset,
            state.lines.len()
        );
        let visible = state
            .lines
            .iter()
            .skip(offset)
            .take(size.height.saturating_sub(1) as usize);
        let mut lines: Vec<Line> = vec![Line::from(header)];
        lines.extend(visible.map(|l| Line::from(l.clone())));

        terminal.draw(|frame| {
            frame.render_widget(Paragraph::new(lines), frame.area());
        })?;
        Ok(())
    }
}

/// Split page content into display lines no wider than `width` characters.
/// Empty source lines become a single blank so vertical structure survives.
fn wrap_content(content: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut out = Vec::new();
    for line in content.split('\n') {
        if line.is_empty() {
            out.push(" ".to_string());
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        for chunk in chars.chunks(width) {
            out.push(chunk.iter().collect());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_preserves_blank_lines() {
        let lines = wrap_content("a\n\nb", 10);
        assert_eq!(lines, vec!["a", " ", "b"]);
    }

    #[test]
    fn wrap_splits_long_lines() {
        let lines = wrap_content("abcdefgh", 3);
        assert_eq!(lines, vec!["abc", "def", "gh"]);
    }

    #[test]
    fn top_page_survives_deletion() {
        let mut state = ScreenState::new();
        let top = state.pages[0].id;
        state.delete_page(top);
        assert_eq!(state.pages.len(), 1);
    }

    #[test]
    fn deleting_the_current_last_page_moves_back() {
        let mut state = ScreenState::new();
        let a = state.add_page(Box::new(|| "a".to_string()));
        let b = state.add_page(Box::new(|| "b".to_string()));
        state.current = 2;
        state.delete_page(b);
        assert_eq!(state.current, 1);
        assert_eq!(state.pages[1].id, a);
    }

    #[test]
    fn page_navigation_wraps_around() {
        let mut state = ScreenState::new();
        state.add_page(Box::new(|| "a".to_string()));
        assert_eq!(state.current, 0);
        state.prev_page();
        assert_eq!(state.current, 1);
        state.next_page();
        assert_eq!(state.current, 0);
    }

    #[test]
    fn scroll_clamps_to_content() {
        let mut state = ScreenState::new();
        state.lines = vec!["x".to_string(); 5];
        state.scroll(-3);
        assert_eq!(state.pages[0].offset, 0);
        state.scroll(100);
        assert_eq!(state.pages[0].offset, 5);
    }
}
