use crate::store::ScoreStore;

#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    pub include_roll_no: bool,
    pub include_grade: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_roll_no: true,
            include_grade: false,
        }
    }
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn fmt_mark(v: f64) -> String {
    let short = format!("{:.1}", v);
    if short.parse::<f64>().ok() == Some(v) {
        short
    } else {
        v.to_string()
    }
}

/// Render the cohort as CSV, header first, one row per student in roster
/// order.
///
/// The percentage column is the one each record's attendance mark was
/// derived from, so a row never pairs a mark with a newer reading.
pub fn marks_csv(store: &ScoreStore, opts: ExportOptions) -> String {
    let mut header: Vec<&str> = vec!["student_id"];
    if opts.include_roll_no {
        header.push("roll_no");
    }
    header.extend(["name", "sessional", "attendance", "total"]);
    if opts.include_grade {
        header.push("grade");
    }
    header.extend(["attendance_percentage", "term"]);

    let term = csv_quote(&store.context().term);
    let mut out = header.join(",");
    out.push('\n');

    for r in store.records() {
        let mut cols: Vec<String> = vec![csv_quote(r.student_id())];
        if opts.include_roll_no {
            cols.push(csv_quote(r.roll_no().unwrap_or("")));
        }
        cols.push(csv_quote(r.display_name()));
        cols.push(fmt_mark(r.sessional()));
        cols.push(fmt_mark(r.attendance()));
        cols.push(fmt_mark(r.total()));
        if opts.include_grade {
            cols.push(r.grade().label().to_string());
        }
        cols.push(fmt_mark(r.attendance_percentage()));
        cols.push(term.clone());

        out.push_str(&cols.join(","));
        out.push('\n');
    }
    out
}
