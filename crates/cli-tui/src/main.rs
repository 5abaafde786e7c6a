use anyhow::{Context, Result};
use clap::Parser;
use tracker::{config::TrackerConfig, scan::{list_tasks, TaskSummary}, status::TaskStatus};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use humansize::{format_size, DECIMAL};

struct App {
    cfg: TrackerConfig,
    tasks: Vec<TaskSummary>,
    system: System,
    table_state: TableState,
    should_quit: bool,
}

impl App {
    fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            tasks: Vec::new(),
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_all();

        // Every refresh re-derives state from disk; nothing is cached between polls
        self.tasks = list_tasks(&self.cfg).unwrap_or_default();
    }

    fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Most recently uploaded task that is currently running
    fn active_task(&self) -> Option<&TaskSummary> {
        self.tasks.iter().find(|t| t.status == TaskStatus::Running)
    }

    fn video_size(&self, task: &TaskSummary) -> Option<u64> {
        std::fs::metadata(task.folder.join(&self.cfg.video_file_name))
            .ok()
            .map(|m| m.len())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = TrackerConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    let refresh_every = Duration::from_millis(args.refresh_ms.max(100));

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(cfg);

    loop {
        app.refresh();

        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(refresh_every)? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => {
                        app.should_quit = true;
                    }
                    crossterm::event::KeyCode::Char('r') => {
                        app.refresh();
                    }
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

/// Terminal monitor for analysis task progress
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Milliseconds between refreshes
    #[arg(long, default_value_t = 1000)]
    refresh_ms: u64,
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 12 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x12.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // CPU / memory
            Constraint::Length(3), // Active task gauge
            Constraint::Min(3),    // Task table
            Constraint::Length(3), // Status bar
        ])
        .split(size);

    render_top_bar(f, app, main_chunks[0]);
    render_active_task(f, app, main_chunks[1]);
    render_task_table(f, app, main_chunks[2]);
    render_status_bar(f, app, main_chunks[3]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() || value.is_infinite() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);

    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);
}

fn render_active_task(f: &mut Frame, app: &App, area: Rect) {
    let Some(task) = app.active_task() else {
        let idle = Paragraph::new("No task running")
            .block(Block::default().borders(Borders::ALL).title("Active"));
        f.render_widget(idle, area);
        return;
    };

    let progress = &task.progress;
    let percent = clamp_percent(progress.progress_percentage);
    let title = format!("Active: {} ({})", task.task_id, truncate_string(&task.course_name, 30));
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(Color::Magenta))
        .percent(percent as u16)
        .label(format!(
            "{}/{} {} - {:.1}% - remaining {}",
            progress.current_step,
            progress.total_steps,
            truncate_string(&progress.current_step_name, 30),
            percent,
            progress.estimated_remaining
        ));
    f.render_widget(gauge, area);
}

fn status_label(status: TaskStatus) -> (&'static str, Color) {
    match status {
        TaskStatus::Pending => ("PEND", Color::Yellow),
        TaskStatus::Running => ("RUN", Color::Cyan),
        TaskStatus::Completed => ("OK", Color::Green),
        TaskStatus::Failed => ("FAIL", Color::Red),
        TaskStatus::Unknown => ("?", Color::Gray),
    }
}

fn render_task_table(f: &mut Frame, app: &mut App, area: Rect) {
    let max_data_rows = (area.height as usize).saturating_sub(3);

    let header = Row::new(vec!["ST", "ID", "COURSE", "STEP", "PCT", "LEFT", "STAGE", "SIZE"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.tasks.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "-".to_string(),
            format!("No tasks in {}", app.cfg.data_dir.display()),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
        ])]
    } else {
        app.tasks
            .iter()
            .take(max_data_rows)
            .map(|task| {
                let (label, color) = status_label(task.status);
                let progress = &task.progress;

                let stage = match (&task.status, &task.error_message) {
                    (TaskStatus::Failed, Some(msg)) => truncate_string(msg, 40),
                    _ => truncate_string(&progress.current_step_name, 40),
                };
                let size = app
                    .video_size(task)
                    .map(|b| format_size(b, DECIMAL))
                    .unwrap_or_else(|| "-".to_string());

                Row::new(vec![
                    label.to_string(),
                    task.task_id.clone(),
                    truncate_string(&task.course_name, 30),
                    format!("{}/{}", progress.current_step, progress.total_steps),
                    format!("{:.1}%", progress.progress_percentage),
                    progress.estimated_remaining.clone(),
                    stage,
                    size,
                ])
                .style(Style::default().fg(color))
                .height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Length(7),
        Constraint::Percentage(25),
        Constraint::Length(6),
        Constraint::Length(7),
        Constraint::Length(8),
        Constraint::Percentage(40),
        Constraint::Length(9),
    ];

    let title = format!("Tasks ({}/{})", max_data_rows.min(app.tasks.len()), app.tasks.len());

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let dir_display = app.cfg.data_dir.display().to_string();

    let status_text = format!(
        "Total: {} | Running: {} | Pending: {} | Completed: {} | Failed: {} | Dir: {} | q=quit r=refresh",
        app.tasks.len(),
        app.count_by_status(TaskStatus::Running),
        app.count_by_status(TaskStatus::Pending),
        app.count_by_status(TaskStatus::Completed),
        app.count_by_status(TaskStatus::Failed),
        truncate_string(&dir_display, 35)
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_truncate_keeps_short_strings() {
        assert_eq!(truncate_string("Biology", 30), "Biology");
        assert_eq!(truncate_string("Transcription", 8), "Trans...");
    }

    #[test]
    fn test_status_colors() {
        assert_eq!(status_label(TaskStatus::Failed), ("FAIL", Color::Red));
        assert_eq!(status_label(TaskStatus::Running).0, "RUN");
    }

    proptest! {
        #[test]
        fn prop_truncate_never_exceeds_limit(s in "\\PC{0,80}", max_len in 3usize..60) {
            let out = truncate_string(&s, max_len);
            prop_assert!(out.chars().count() <= max_len);
            if s.chars().count() <= max_len {
                prop_assert_eq!(out, s);
            } else {
                prop_assert!(out.ends_with("..."));
            }
        }

        #[test]
        fn prop_clamp_percent_in_range(v in proptest::num::f64::ANY) {
            let p = clamp_percent(v);
            prop_assert!((0.0..=100.0).contains(&p));
        }
    }
}
