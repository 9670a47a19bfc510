#[macro_use] extern crate rocket;

use std::collections::HashMap;
use std::sync::RwLock;
use chrono::NaiveDateTime;
use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::fs::FileServer;
use rocket::{Build, Rocket};
use rocket_dyn_templates::{handlebars, Template};
use rocket_dyn_templates::handlebars::{Handlebars, Helper};
use crate::admin::AdminRegistry;
use crate::auth::UserInfo;
use crate::config::AppConfig;
use crate::datetime::{dtstr, timestr, weekday_name};
use crate::db::DbPoolFairing;
use crate::mail::Mailer;

#[cfg(test)]
mod tests;
mod admin;
mod auth;
mod blog;
mod class_sessions;
mod config;
mod contact;
mod dashboard;
mod datetime;
mod db;
mod expenses;
mod files;
mod mail;
mod money;
mod payments;
mod rates;
mod receipt;
mod reports;
mod schedules;
mod site;
mod students;
mod teachers;
mod util;

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
struct SessionId(String);

struct LoginSession {
    user_info: UserInfo,
    created: NaiveDateTime,
}

#[derive(Default)]
struct AppState {
    sessions: HashMap<SessionId, LoginSession>,
}
type SharedAppState = RwLock<AppState>;

fn admin_registry() -> AdminRegistry {
    AdminRegistry::new(vec![
        Box::new(students::StudentAdmin),
        Box::new(students::ParentAdmin),
        Box::new(teachers::TeacherAdmin),
        Box::new(schedules::ScheduleAdmin),
        Box::new(schedules::EnrollmentAdmin),
        Box::new(class_sessions::SessionAdmin),
        Box::new(class_sessions::AttendanceAdmin),
        Box::new(rates::RateAdmin),
        Box::new(payments::PaymentAdmin),
        Box::new(expenses::ExpenseAdmin),
        Box::new(site::SERVICE_ADMIN),
        Box::new(site::INSTALLATION_ADMIN),
        Box::new(site::StoreCategoryAdmin),
        Box::new(site::ProductAdmin),
        Box::new(blog::BlogCategoryAdmin),
        Box::new(blog::BlogPostAdmin),
    ])
}

fn register_helpers(handlebars: &mut Handlebars) {
    handlebars.register_helper("stringify",
                               Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                   let param = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("stringify", 0))?;
                                   let json = serde_json::to_string(param.value()).unwrap_or_else(|_| "Invalid JSON".to_string());
                                   out.write(json.as_ref())?;
                                   Ok(())
                               }));
    handlebars.register_helper("fdate",
                               Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                   let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("fdate", 0))?.value();
                                   out.write(&dtstr(val.as_str(), false))?;
                                   Ok(())
                               }));
    handlebars.register_helper("fdatetime",
                               Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                   let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("fdatetime", 0))?.value();
                                   out.write(&dtstr(val.as_str(), true))?;
                                   Ok(())
                               }));
    handlebars.register_helper("ftime",
                               Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                   let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("ftime", 0))?.value();
                                   out.write(&timestr(val.as_str()))?;
                                   Ok(())
                               }));
    handlebars.register_helper("weekday",
                               Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                   let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("weekday", 0))?.value();
                                   out.write(weekday_name(val.as_i64().unwrap_or(-1)))?;
                                   Ok(())
                               }));
}

pub fn build_rocket(figment: Figment) -> Rocket<Build> {
    let rocket = rocket::custom(figment)
        .attach(Template::custom(|engines| register_helpers(&mut engines.handlebars)))
        .attach(AdHoc::try_on_ignite("Application config", |rocket| async move {
            let cfg = match AppConfig::from_figment(rocket.figment()) {
                Ok(cfg) => cfg,
                Err(err) => {
                    error!("Invalid application config: {err}");
                    return Err(rocket);
                }
            };
            let mailer = match Mailer::from_config(&cfg) {
                Ok(mailer) => mailer,
                Err(err) => {
                    error!("Cannot set up mailer: {err}");
                    return Err(rocket);
                }
            };
            Ok(rocket.manage(cfg).manage(mailer))
        }))
        .attach(DbPoolFairing())
        .mount("/static", FileServer::from("./static"))
        .manage(admin_registry())
        .manage(SharedAppState::new(AppState::default()));
    let rocket = auth::extend(rocket);
    let rocket = admin::extend(rocket);
    let rocket = files::extend(rocket);
    let rocket = schedules::extend(rocket);
    let rocket = dashboard::extend(rocket);
    let rocket = reports::extend(rocket);
    let rocket = site::extend(rocket);
    let rocket = blog::extend(rocket);
    contact::extend(rocket)
}

#[launch]
fn rocket() -> _ {
    build_rocket(rocket::Config::figment())
}
