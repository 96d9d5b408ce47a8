use askama::Template;
use seva_core::{NotificationRecord, UrgencyBucket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

#[derive(Template)]
#[template(path = "reminder.txt")]
struct ReminderTemplate<'a> {
    headline: String,
    scheme_name: &'a str,
    deadline: String,
    status_label: String,
    call_to_action: &'a str,
}

pub fn subject_for(record: &NotificationRecord) -> String {
    match record.bucket {
        UrgencyBucket::Expired => format!("{} deadline has passed", record.scheme_name),
        _ => format!("Reminder: {} deadline approaching", record.scheme_name),
    }
}

fn status_label(days: i64) -> String {
    match days {
        d if d < 0 => format!("closed {} day(s) ago", -d),
        0 => "closes today".to_string(),
        1 => "1 day left".to_string(),
        d => format!("{d} days left"),
    }
}

pub fn render(record: &NotificationRecord) -> Result<RenderedMessage, askama::Error> {
    let expired = record.bucket == UrgencyBucket::Expired;
    let template = ReminderTemplate {
        headline: if expired {
            format!("The deadline for {} has passed.", record.scheme_name)
        } else {
            format!("The deadline for {} is approaching.", record.scheme_name)
        },
        scheme_name: &record.scheme_name,
        deadline: record.deadline.format("%d %B %Y").to_string(),
        status_label: status_label(record.days_remaining),
        call_to_action: if expired {
            "Check the scheme page in case the window has been extended or reopened."
        } else {
            "Complete your application on the scheme portal before the deadline."
        },
    };
    Ok(RenderedMessage {
        subject: subject_for(record),
        body: template.render()?,
    })
}
